//! Adaptive File Extraction - turns raw uploaded bytes into row records
//!
//! Several independent parsing strategies compete over the same buffer. The
//! extractor pre-analyzes the buffer, picks the strategies likely to succeed,
//! runs them, and keeps the highest-confidence result. A naive line splitter
//! acts as the emergency floor so that even badly mangled files produce
//! something a human can review.

pub mod analysis;
pub mod strategy;
pub mod standard;
pub mod alternative;
pub mod headerless;
pub mod complex;
pub mod dirty;
pub mod extractor;

pub use analysis::{BufferAnalysis, LineEnding};
pub use strategy::{ExtractionStrategy, strategy_registry};
pub use extractor::{AdaptiveExtractor, ExtractorConfig};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata describing how an extraction went
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    /// Delimiter the winning parse used
    pub delimiter: String,

    /// Whether the first row was treated as headers
    pub has_headers: bool,

    /// Number of data records produced
    pub record_count: usize,

    /// Detected encoding (currently always utf-8, lossy-decoded)
    pub encoding: String,

    /// Wall-clock parse duration
    pub parse_duration_ms: u64,

    /// Structural quality in [0, 1]: row-length consistency and fill ratio
    pub quality_score: f64,

    /// Human-readable issues found while parsing
    pub issues: Vec<String>,
}

impl ExtractionMetadata {
    pub fn empty() -> Self {
        Self {
            delimiter: ",".to_string(),
            has_headers: false,
            record_count: 0,
            encoding: "utf-8".to_string(),
            parse_duration_ms: 0,
            quality_score: 0.0,
            issues: Vec::new(),
        }
    }
}

/// Result of one extraction attempt (one strategy, one buffer)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,

    /// Records as JSON objects (field name -> raw cell value or null)
    pub records: Vec<Value>,

    /// Confidence in [0, 100]
    pub confidence: f64,

    /// Identifier of the strategy that produced this result
    pub strategy: String,

    pub metadata: ExtractionMetadata,

    pub error: Option<String>,
}

impl ExtractionResult {
    /// A failed result carries no data, per the extraction contract.
    pub fn failed(strategy: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            records: Vec::new(),
            confidence: 0.0,
            strategy: strategy.to_string(),
            metadata: ExtractionMetadata::empty(),
            error: Some(error.into()),
        }
    }
}

/// Convert raw header/row matrices into JSON object records.
///
/// Empty cells become nulls; rows shorter than the header list are padded
/// with nulls so every record exposes the full key set.
pub fn build_records(headers: &[String], rows: &[Vec<Option<String>>]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let mut obj = Map::new();
            for (idx, header) in headers.iter().enumerate() {
                let cell = row
                    .get(idx)
                    .and_then(|c| c.as_ref())
                    .map(|s| Value::String(s.clone()))
                    .unwrap_or(Value::Null);
                obj.insert(header.clone(), cell);
            }
            Value::Object(obj)
        })
        .collect()
}

/// Measure structural quality of a parsed row matrix.
///
/// Returns a score in [0, 1] plus the issues found. Consistent row widths and
/// a low empty-cell ratio score high.
pub fn measure_quality(rows: &[Vec<Option<String>>], expected_columns: usize) -> (f64, Vec<String>) {
    if rows.is_empty() {
        return (0.0, vec!["no data rows".to_string()]);
    }

    let mut issues = Vec::new();

    let consistent = rows.iter().filter(|r| r.len() == expected_columns).count();
    let consistency = consistent as f64 / rows.len() as f64;
    if consistency < 1.0 {
        issues.push(format!(
            "{} of {} rows deviate from the expected column count {}",
            rows.len() - consistent,
            rows.len(),
            expected_columns
        ));
    }

    let total_cells: usize = rows.iter().map(|r| r.len()).sum();
    let empty_cells: usize = rows
        .iter()
        .flat_map(|r| r.iter())
        .filter(|c| c.is_none())
        .count();
    let empty_ratio = if total_cells > 0 {
        empty_cells as f64 / total_cells as f64
    } else {
        1.0
    };
    if empty_ratio > 0.3 {
        issues.push(format!(
            "high empty-cell ratio: {:.0}%",
            empty_ratio * 100.0
        ));
    }

    let score = (consistency * (1.0 - empty_ratio * 0.5)).clamp(0.0, 1.0);
    (score, issues)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_build_records_pads_short_rows() {
        let headers = vec!["name".to_string(), "price".to_string()];
        let rows = vec![vec![cell("Widget"), cell("9.99")], vec![cell("Bolt")]];

        let records = build_records(&headers, &rows);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "Widget");
        assert_eq!(records[1]["price"], Value::Null);
    }

    #[test]
    fn test_quality_perfect_matrix() {
        let rows = vec![
            vec![cell("a"), cell("b")],
            vec![cell("c"), cell("d")],
        ];
        let (score, issues) = measure_quality(&rows, 2);
        assert!((score - 1.0).abs() < f64::EPSILON);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_quality_flags_ragged_rows() {
        let rows = vec![
            vec![cell("a"), cell("b")],
            vec![cell("c")],
        ];
        let (score, issues) = measure_quality(&rows, 2);
        assert!(score < 1.0);
        assert_eq!(issues.len(), 1);
    }
}
