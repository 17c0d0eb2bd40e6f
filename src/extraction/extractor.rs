//! Adaptive Extractor - strategy selection, execution and scoring
//!
//! Pre-analyzes the buffer, picks a bounded candidate set, runs candidates
//! in parallel or sequentially, and keeps the best-scoring result. When
//! nothing clears the confidence floor an emergency line-splitter produces a
//! deliberately low-confidence result so the import can be routed to manual
//! review instead of disappearing.

use crate::error::{ImportError, Result};
use crate::extraction::analysis::{self, BufferAnalysis};
use crate::extraction::strategy::{strategy_registry, ExtractionStrategy};
use crate::extraction::{build_records, ExtractionMetadata, ExtractionResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Confidence attached to the emergency fallback result
pub const EMERGENCY_CONFIDENCE: f64 = 30.0;

/// Extractor tuning knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Run candidate strategies concurrently
    pub parallel: bool,

    /// In parallel mode, accept the first priority-ordered result clearing
    /// `high_confidence` instead of waiting for the global best
    pub early_termination: bool,

    /// Floor a result must clear to be accepted without review flagging
    pub min_confidence: f64,

    /// Bar for early termination
    pub high_confidence: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            early_termination: false,
            min_confidence: 60.0,
            high_confidence: 85.0,
        }
    }
}

/// Adaptive file extractor over the compile-time strategy registry.
pub struct AdaptiveExtractor {
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
    config: ExtractorConfig,
}

impl AdaptiveExtractor {
    pub fn new() -> Self {
        Self::with_config(ExtractorConfig::default())
    }

    pub fn with_config(config: ExtractorConfig) -> Self {
        Self {
            strategies: strategy_registry(),
            config,
        }
    }

    /// Pick the strategies worth running for this buffer.
    ///
    /// Standard and dirty-recovery always participate; the specialized
    /// strategies are gated on what the analysis actually saw.
    fn select_candidates(&self, analysis: &BufferAnalysis) -> Vec<Arc<dyn ExtractionStrategy>> {
        let alternative_plausible = analysis
            .plausible_delimiters
            .iter()
            .any(|&d| d != ',')
            || analysis.dominant_delimiter != ',';

        self.strategies
            .iter()
            .filter(|s| match s.name() {
                "standard" | "dirty_recovery" => true,
                "alternative_delimiter" => alternative_plausible,
                "numeric_headerless" => {
                    analysis.numeric_heavy && !analysis.first_row_textual
                }
                "complex_fields" => analysis.has_quotes || analysis.has_escapes,
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Extract the buffer, returning the single authoritative result.
    pub async fn extract(&self, buffer: &[u8], filename: &str) -> Result<ExtractionResult> {
        if buffer.is_empty() {
            return Err(ImportError::Extraction(format!(
                "empty upload: {}",
                filename
            )));
        }

        let analysis = analysis::analyze(buffer);
        let candidates = self.select_candidates(&analysis);
        debug!(
            candidates = candidates.len(),
            delimiter = %analysis.dominant_delimiter,
            "selected extraction candidates for {}", filename
        );

        let results = if self.config.parallel {
            self.run_parallel(&candidates, buffer, filename).await
        } else {
            self.run_sequential(&candidates, buffer, filename)
        };

        let best = self.select_best(results);

        match best {
            Some(result) if result.confidence >= self.config.min_confidence => {
                info!(
                    strategy = %result.strategy,
                    confidence = result.confidence,
                    records = result.metadata.record_count,
                    "extraction succeeded for {}", filename
                );
                Ok(result)
            }
            below_floor => {
                warn!(
                    "no strategy cleared the confidence floor for {}, applying emergency fallback",
                    filename
                );
                self.emergency_fallback(buffer, filename, &analysis, below_floor)
            }
        }
    }

    /// Spawn every candidate and wait all of them out. Losing strategies are
    /// not cancelled: in-memory parsing has no side effects worth aborting.
    async fn run_parallel(
        &self,
        candidates: &[Arc<dyn ExtractionStrategy>],
        buffer: &[u8],
        filename: &str,
    ) -> Vec<ExtractionResult> {
        let shared: Arc<Vec<u8>> = Arc::new(buffer.to_vec());
        let filename = filename.to_string();

        let handles: Vec<_> = candidates
            .iter()
            .map(|strategy| {
                let strategy = Arc::clone(strategy);
                let buffer = Arc::clone(&shared);
                let filename = filename.clone();
                tokio::spawn(async move { strategy.execute(&buffer, &filename) })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(result)) if result.success => results.push(result),
                Ok(Ok(result)) => {
                    debug!(strategy = %result.strategy, "strategy failed closed");
                }
                Ok(Err(e)) => debug!("strategy errored: {}", e),
                Err(e) => warn!("strategy task panicked: {}", e),
            }
        }
        results
    }

    /// Run candidates in priority order, stopping at the first result that
    /// clears the floor.
    fn run_sequential(
        &self,
        candidates: &[Arc<dyn ExtractionStrategy>],
        buffer: &[u8],
        filename: &str,
    ) -> Vec<ExtractionResult> {
        let mut results = Vec::new();
        for strategy in candidates {
            if !strategy.can_handle(buffer) {
                continue;
            }
            match strategy.execute(buffer, filename) {
                Ok(result) if result.success => {
                    let clears = result.confidence >= self.config.min_confidence;
                    results.push(result);
                    if clears {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(strategy = %strategy.name(), "strategy errored: {}", e),
            }
        }
        results
    }

    fn select_best(&self, mut results: Vec<ExtractionResult>) -> Option<ExtractionResult> {
        if results.is_empty() {
            return None;
        }

        if self.config.parallel && self.config.early_termination {
            // Priority order mirrors the registry order the candidates ran in.
            let priority = |name: &str| {
                self.strategies
                    .iter()
                    .find(|s| s.name() == name)
                    .map(|s| s.priority())
                    .unwrap_or(0)
            };
            results.sort_by(|a, b| priority(&b.strategy).cmp(&priority(&a.strategy)));
            if let Some(idx) = results
                .iter()
                .position(|r| r.confidence >= self.config.high_confidence)
            {
                return Some(results.swap_remove(idx));
            }
        }

        results
            .into_iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Naive delimiter split used when everything else is below the floor.
    fn emergency_fallback(
        &self,
        buffer: &[u8],
        filename: &str,
        analysis: &BufferAnalysis,
        best_attempt: Option<ExtractionResult>,
    ) -> Result<ExtractionResult> {
        let text = String::from_utf8_lossy(buffer);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();

        let mut fallback = if lines.is_empty() {
            None
        } else {
            let delimiter = analysis.dominant_delimiter;
            let split: Vec<Vec<Option<String>>> = lines
                .iter()
                .map(|line| {
                    line.split(delimiter)
                        .map(|c| {
                            let t = c.trim();
                            if t.is_empty() {
                                None
                            } else {
                                Some(t.to_string())
                            }
                        })
                        .collect()
                })
                .collect();

            let width = split.iter().map(|r| r.len()).max().unwrap_or(1);
            let has_headers = analysis.header_likely && split.len() > 1;
            let mut iter = split.into_iter();
            let headers: Vec<String> = if has_headers {
                iter.next()
                    .unwrap_or_default()
                    .into_iter()
                    .enumerate()
                    .map(|(i, c)| c.unwrap_or_else(|| format!("column_{}", i + 1)))
                    .collect()
            } else {
                (1..=width).map(|i| format!("column_{}", i)).collect()
            };
            let rows: Vec<Vec<Option<String>>> = iter.collect();

            if rows.is_empty() {
                None
            } else {
                let record_count = rows.len();
                Some(ExtractionResult {
                    success: true,
                    records: build_records(&headers, &rows),
                    confidence: EMERGENCY_CONFIDENCE,
                    strategy: "emergency_fallback".to_string(),
                    metadata: ExtractionMetadata {
                        delimiter: delimiter.to_string(),
                        has_headers,
                        record_count,
                        encoding: "utf-8".to_string(),
                        parse_duration_ms: 0,
                        quality_score: 0.3,
                        issues: vec![
                            "low-confidence extraction, flagged for manual review".to_string(),
                        ],
                    },
                    error: None,
                })
            }
        };

        // Keep whichever low-confidence result says more about the file.
        if let Some(best) = best_attempt {
            let keep_best = fallback
                .as_ref()
                .map(|f| best.confidence > f.confidence)
                .unwrap_or(true);
            if keep_best {
                let mut best = best;
                best.metadata
                    .issues
                    .push("low-confidence extraction, flagged for manual review".to_string());
                fallback = Some(best);
            }
        }

        fallback.ok_or_else(|| {
            ImportError::Extraction(format!(
                "no strategy produced any records for {}",
                filename
            ))
        })
    }
}

impl Default for AdaptiveExtractor {
    fn default() -> Self {
        Self::new()
    }
}
