//! Numeric/headerless strategy - files whose first row is data
//!
//! Applies when the first row is not distinguishably textual relative to the
//! rest of the file. Column names are synthesized positionally so downstream
//! mapping still has keys to work with.

use crate::error::Result;
use crate::extraction::analysis;
use crate::extraction::strategy::{parse_csv, ExtractionStrategy};
use crate::extraction::{build_records, measure_quality, ExtractionMetadata, ExtractionResult};
use std::time::Instant;
use tracing::debug;

const BASE_CONFIDENCE: f64 = 70.0;
const QUALITY_ADJUSTMENT: f64 = 20.0;

pub struct HeaderlessStrategy;

impl HeaderlessStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HeaderlessStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for HeaderlessStrategy {
    fn name(&self) -> &'static str {
        "numeric_headerless"
    }

    fn priority(&self) -> u8 {
        60
    }

    fn can_handle(&self, buffer: &[u8]) -> bool {
        let analysis = analysis::analyze(buffer);
        analysis.numeric_heavy && !analysis.first_row_textual
    }

    fn execute(&self, buffer: &[u8], filename: &str) -> Result<ExtractionResult> {
        let analysis = analysis::analyze(buffer);
        let delimiter = analysis.dominant_delimiter;

        let start = Instant::now();
        let (headers, rows) = parse_csv(buffer, delimiter as u8, false)?;
        let parse_duration_ms = start.elapsed().as_millis() as u64;

        if rows.is_empty() {
            return Ok(ExtractionResult::failed(
                self.name(),
                format!("no records parsed from {}", filename),
            ));
        }

        let (quality, issues) = measure_quality(&rows, headers.len());
        let confidence =
            (BASE_CONFIDENCE + (quality - 0.5) * QUALITY_ADJUSTMENT).clamp(0.0, 100.0);

        let records = build_records(&headers, &rows);
        debug!(
            records = records.len(),
            columns = headers.len(),
            "headerless strategy parsed {}", filename
        );

        Ok(ExtractionResult {
            success: true,
            confidence,
            strategy: self.name().to_string(),
            metadata: ExtractionMetadata {
                delimiter: delimiter.to_string(),
                has_headers: false,
                record_count: records.len(),
                encoding: "utf-8".to_string(),
                parse_duration_ms,
                quality_score: quality,
                issues,
            },
            records,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_file_gets_positional_names() {
        let strategy = HeaderlessStrategy::new();
        let result = strategy
            .execute(b"1,2,3\n4,5,6\n7,8,9\n", "matrix.csv")
            .unwrap();

        assert!(result.success);
        assert!(!result.metadata.has_headers);
        assert_eq!(result.metadata.record_count, 3);
        assert_eq!(result.records[0]["column_1"], "1");
        assert_eq!(result.records[2]["column_3"], "9");
    }

    #[test]
    fn test_declines_textual_first_row() {
        let strategy = HeaderlessStrategy::new();
        assert!(!strategy.can_handle(b"name,price\n1,2\n"));
    }

    #[test]
    fn test_accepts_all_numeric_file() {
        let strategy = HeaderlessStrategy::new();
        assert!(strategy.can_handle(b"1,2\n3,4\n5,6\n"));
    }
}
