//! Learning Store - Learns from confirmed field-mapping decisions
//!
//! Every time a user confirms a source-field -> target-field mapping, the
//! normalized source pattern is stored with usage and success statistics.
//! Future imports with unseen field names get exact, fuzzy and partial
//! suggestions ranked by predicted confidence.
//!
//! Architecture: SQLite, one row per normalized pattern, updated in place.

use crate::error::{ImportError, Result};
use crate::inference::expand_abbreviations;
use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Minimum usage count for a pattern to qualify as a suggestion source
pub const MIN_USAGE_COUNT: u32 = 1;

/// Minimum rolling success rate for a pattern to qualify
pub const MIN_SUCCESS_RATE: f64 = 0.4;

/// Character-set similarity a fuzzy match must clear
pub const FUZZY_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Confidence multiplier applied to fuzzy matches (on top of similarity)
pub const FUZZY_DISCOUNT: f64 = 0.8;

/// Confidence multiplier applied to partial sub-token matches
pub const PARTIAL_DISCOUNT: f64 = 0.6;

/// Confidence multiplier for persisted name variations
pub const VARIATION_DISCOUNT: f64 = 0.8;

/// Suggestions returned per field
pub const MAX_SUGGESTIONS: usize = 3;

/// How many recent strategies each pattern remembers
const STRATEGY_HISTORY_LIMIT: usize = 5;

/// A learned source-pattern -> target-field association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    /// Normalized source pattern (unique key)
    pub pattern: String,

    pub target_field: String,

    /// Confidence of the most recent confirmation, in [0, 1]
    pub confidence: f64,

    pub usage_count: u32,

    /// Running weighted average of confirmation confidences
    pub success_rate: f64,

    pub last_used_at: String,

    /// Strategy that produced the extraction this mapping came from
    pub strategy: Option<String>,

    /// Free-form JSON metadata (recent strategy history lives here)
    pub metadata: Option<String>,
}

/// One ranked mapping suggestion for an unseen field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSuggestion {
    pub source_field: String,
    pub target_field: String,

    /// Predicted confidence in [0, 1]
    pub confidence: f64,

    /// exact, fuzzy or partial
    pub match_kind: String,

    /// The stored pattern that produced this suggestion
    pub pattern: String,
}

/// Store-wide learning statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningStats {
    pub pattern_count: u32,
    pub total_usage: u32,
    pub average_success_rate: f64,
    pub by_strategy: HashMap<String, u32>,
}

/// Learning Store - persistent mapping memory backed by SQLite
pub struct LearningStore {
    path: PathBuf,
    db: Mutex<Connection>,
}

impl LearningStore {
    /// Open (or create) a learning store under the given directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let db_path = path.join("learned_patterns.db");
        let db = Connection::open(&db_path)
            .map_err(|e| ImportError::Storage(format!("failed to open database: {}", e)))?;

        let store = Self {
            path,
            db: Mutex::new(db),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and the demo CLI.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| ImportError::Storage(format!("failed to open database: {}", e)))?;
        let store = Self {
            path: PathBuf::new(),
            db: Mutex::new(db),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock_db()?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS learned_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL UNIQUE,
                target_field TEXT NOT NULL,
                confidence REAL NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                success_rate REAL NOT NULL,
                last_used_at TEXT NOT NULL,
                strategy TEXT,
                metadata TEXT
            )
            "#,
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_patterns_usage ON learned_patterns(usage_count, last_used_at)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_patterns_target ON learned_patterns(target_field)",
            [],
        )?;
        Ok(())
    }

    /// Directory the store persists under; empty for in-memory stores.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| ImportError::Storage("learning store lock poisoned".to_string()))
    }

    /// Record a confirmed mapping decision.
    ///
    /// Updates the existing pattern in place (usage count + running weighted
    /// success rate) or creates it, then persists discounted name variations
    /// to widen future fuzzy recall.
    pub fn record_mapping(
        &self,
        source_field: &str,
        target_field: &str,
        confidence: f64,
        strategy: Option<&str>,
    ) -> Result<()> {
        let pattern = normalize_pattern(source_field);
        if pattern.is_empty() {
            return Err(ImportError::Mapping(format!(
                "source field {:?} normalizes to nothing",
                source_field
            )));
        }

        self.upsert_pattern(&pattern, target_field, confidence, strategy, true)?;

        for variation in generate_variations(&pattern) {
            // Never let a variation overwrite a distinct existing mapping.
            if let Some(existing) = self.get_pattern(&variation)? {
                if existing.target_field != target_field {
                    continue;
                }
            }
            self.upsert_pattern(
                &variation,
                target_field,
                confidence * VARIATION_DISCOUNT,
                strategy,
                false,
            )?;
        }

        Ok(())
    }

    fn upsert_pattern(
        &self,
        pattern: &str,
        target_field: &str,
        confidence: f64,
        strategy: Option<&str>,
        log_update: bool,
    ) -> Result<()> {
        let confidence = confidence.clamp(0.0, 1.0);
        let now = Utc::now().to_rfc3339();
        let existing = self.get_pattern(pattern)?;

        let db = self.lock_db()?;
        match existing {
            Some(current) => {
                let count = current.usage_count as f64;
                let new_rate = (current.success_rate * count + confidence) / (count + 1.0);
                let metadata = push_strategy_history(current.metadata.as_deref(), strategy);

                db.execute(
                    r#"
                    UPDATE learned_patterns
                    SET target_field = ?2, confidence = ?3, usage_count = usage_count + 1,
                        success_rate = ?4, last_used_at = ?5, strategy = ?6, metadata = ?7
                    WHERE pattern = ?1
                    "#,
                    params![
                        pattern,
                        target_field,
                        confidence,
                        new_rate,
                        now,
                        strategy,
                        metadata
                    ],
                )?;
                if log_update {
                    info!(
                        "updated learned pattern: {} -> {} (used {} times)",
                        pattern,
                        target_field,
                        current.usage_count + 1
                    );
                }
            }
            None => {
                let metadata = push_strategy_history(None, strategy);
                db.execute(
                    r#"
                    INSERT INTO learned_patterns
                    (pattern, target_field, confidence, usage_count, success_rate,
                     last_used_at, strategy, metadata)
                    VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)
                    "#,
                    params![pattern, target_field, confidence, confidence, now, strategy, metadata],
                )?;
                if log_update {
                    info!("learned new pattern: {} -> {}", pattern, target_field);
                }
            }
        }
        Ok(())
    }

    /// Fetch a single pattern by its normalized key.
    pub fn get_pattern(&self, pattern: &str) -> Result<Option<LearnedPattern>> {
        let db = self.lock_db()?;
        let result = db.query_row(
            r#"
            SELECT pattern, target_field, confidence, usage_count, success_rate,
                   last_used_at, strategy, metadata
            FROM learned_patterns WHERE pattern = ?1
            "#,
            params![pattern],
            row_to_pattern,
        );
        match result {
            Ok(pattern) => Ok(Some(pattern)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Suggest target fields for an unseen source field.
    ///
    /// Tries exact normalized match, then character-set fuzzy match, then
    /// partial sub-token containment; results are capped and ranked by
    /// predicted confidence.
    pub fn suggest(&self, source_field: &str) -> Result<Vec<MappingSuggestion>> {
        let query = normalize_pattern(source_field);
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let qualifying = self.qualifying_patterns()?;
        let mut suggestions: Vec<MappingSuggestion> = Vec::new();

        // (a) exact
        if let Some(exact) = qualifying.iter().find(|p| p.pattern == query) {
            suggestions.push(MappingSuggestion {
                source_field: source_field.to_string(),
                target_field: exact.target_field.clone(),
                confidence: exact.success_rate,
                match_kind: "exact".to_string(),
                pattern: exact.pattern.clone(),
            });
        }

        // (b) fuzzy: character-set Jaccard. Order- and length-insensitive on
        // purpose; recall over precision at this stage.
        for pattern in &qualifying {
            if pattern.pattern == query {
                continue;
            }
            let similarity = charset_similarity(&query, &pattern.pattern);
            if similarity >= FUZZY_SIMILARITY_THRESHOLD {
                suggestions.push(MappingSuggestion {
                    source_field: source_field.to_string(),
                    target_field: pattern.target_field.clone(),
                    confidence: pattern.success_rate * similarity * FUZZY_DISCOUNT,
                    match_kind: "fuzzy".to_string(),
                    pattern: pattern.pattern.clone(),
                });
            }
        }

        // (c) partial: any >= 3-char query token contained in a pattern key
        let tokens: Vec<&str> = query.split('_').filter(|t| t.len() >= 3).collect();
        for pattern in &qualifying {
            if suggestions.iter().any(|s| s.pattern == pattern.pattern) {
                continue;
            }
            if tokens.iter().any(|t| pattern.pattern.contains(t)) {
                suggestions.push(MappingSuggestion {
                    source_field: source_field.to_string(),
                    target_field: pattern.target_field.clone(),
                    confidence: pattern.success_rate * PARTIAL_DISCOUNT,
                    match_kind: "partial".to_string(),
                    pattern: pattern.pattern.clone(),
                });
            }
        }

        suggestions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        suggestions.truncate(MAX_SUGGESTIONS);
        debug!(
            field = source_field,
            count = suggestions.len(),
            "mapping suggestions computed"
        );
        Ok(suggestions)
    }

    fn qualifying_patterns(&self) -> Result<Vec<LearnedPattern>> {
        let db = self.lock_db()?;
        let mut stmt = db.prepare(
            r#"
            SELECT pattern, target_field, confidence, usage_count, success_rate,
                   last_used_at, strategy, metadata
            FROM learned_patterns
            WHERE usage_count >= ?1 AND success_rate >= ?2
            ORDER BY usage_count DESC, success_rate DESC
            "#,
        )?;
        let rows = stmt.query_map(params![MIN_USAGE_COUNT, MIN_SUCCESS_RATE], row_to_pattern)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Drop rarely used patterns that have aged past the retention window.
    pub fn prune(&self, usage_floor: u32, retention_days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        let db = self.lock_db()?;
        let removed = db.execute(
            "DELETE FROM learned_patterns WHERE usage_count < ?1 AND last_used_at < ?2",
            params![usage_floor, cutoff],
        )?;
        if removed > 0 {
            info!("pruned {} stale learned patterns", removed);
        }
        Ok(removed)
    }

    /// Store-wide statistics for the monitoring surface.
    pub fn stats(&self) -> Result<LearningStats> {
        let db = self.lock_db()?;

        let (pattern_count, total_usage, average_success_rate): (u32, u32, f64) = db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(usage_count), 0), COALESCE(AVG(success_rate), 0.0) FROM learned_patterns",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut by_strategy = HashMap::new();
        let mut stmt = db.prepare(
            "SELECT COALESCE(strategy, 'unknown'), COUNT(*) FROM learned_patterns GROUP BY strategy",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        for row in rows.flatten() {
            by_strategy.insert(row.0, row.1);
        }

        Ok(LearningStats {
            pattern_count,
            total_usage,
            average_success_rate,
            by_strategy,
        })
    }
}

fn row_to_pattern(row: &rusqlite::Row<'_>) -> rusqlite::Result<LearnedPattern> {
    Ok(LearnedPattern {
        pattern: row.get(0)?,
        target_field: row.get(1)?,
        confidence: row.get(2)?,
        usage_count: row.get(3)?,
        success_rate: row.get(4)?,
        last_used_at: row.get(5)?,
        strategy: row.get(6)?,
        metadata: row.get(7)?,
    })
}

/// Normalize a source field name into a pattern key: lowercase, runs of
/// non-alphanumerics collapse to single underscores, outer underscores trim.
pub fn normalize_pattern(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Common affixes whose removal yields a useful variation
const STRIP_PREFIXES: [&str; 4] = ["raw_", "src_", "source_", "import_"];
const STRIP_SUFFIXES: [&str; 4] = ["_field", "_col", "_column", "_value"];
const VARIATION_LIMIT: usize = 5;

/// Bounded set of variations of a normalized pattern.
fn generate_variations(pattern: &str) -> Vec<String> {
    let mut variations = Vec::new();
    let mut push = |candidate: String| {
        if !candidate.is_empty() && candidate != pattern && !variations.contains(&candidate) {
            variations.push(candidate);
        }
    };

    for prefix in STRIP_PREFIXES {
        if let Some(stripped) = pattern.strip_prefix(prefix) {
            push(stripped.to_string());
        }
    }
    for suffix in STRIP_SUFFIXES {
        if let Some(stripped) = pattern.strip_suffix(suffix) {
            push(stripped.to_string());
        }
    }
    push(expand_abbreviations(pattern));

    variations.truncate(VARIATION_LIMIT);
    variations
}

fn push_strategy_history(metadata: Option<&str>, strategy: Option<&str>) -> String {
    let mut history: Vec<String> = metadata
        .and_then(|m| serde_json::from_str::<serde_json::Value>(m).ok())
        .and_then(|v| {
            v.get("recent_strategies")
                .and_then(|s| serde_json::from_value(s.clone()).ok())
        })
        .unwrap_or_default();

    if let Some(strategy) = strategy {
        history.push(strategy.to_string());
        if history.len() > STRATEGY_HISTORY_LIMIT {
            let excess = history.len() - STRATEGY_HISTORY_LIMIT;
            history.drain(..excess);
        }
    }

    serde_json::json!({ "recent_strategies": history }).to_string()
}

/// Character-set Jaccard similarity (intersection over union).
fn charset_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<char> = a.chars().filter(|c| *c != '_').collect();
    let set_b: HashSet<char> = b.chars().filter(|c| *c != '_').collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}
