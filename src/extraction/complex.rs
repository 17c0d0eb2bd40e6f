//! Complex-fields strategy - embedded quotes, escapes and multi-line cells
//!
//! Tuned for exports where free-text columns carry commas, doubled quotes or
//! literal newlines inside quoted cells.

use crate::error::Result;
use crate::extraction::strategy::ExtractionStrategy;
use crate::extraction::{build_records, measure_quality, ExtractionMetadata, ExtractionResult};
use std::time::Instant;
use tracing::debug;

const BASE_CONFIDENCE: f64 = 75.0;
const QUALITY_ADJUSTMENT: f64 = 20.0;

pub struct ComplexFieldsStrategy;

impl ComplexFieldsStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ComplexFieldsStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for ComplexFieldsStrategy {
    fn name(&self) -> &'static str {
        "complex_fields"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn can_handle(&self, buffer: &[u8]) -> bool {
        buffer.contains(&b'"') || buffer.contains(&b'\\')
    }

    fn execute(&self, buffer: &[u8], filename: &str) -> Result<ExtractionResult> {
        let start = Instant::now();

        // Quote-aware reader: doubled quotes inside quoted cells, backslash
        // escapes, and newlines within quoted cells are all legal.
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b',')
            .has_headers(true)
            .flexible(true)
            .quoting(true)
            .double_quote(true)
            .escape(Some(b'\\'))
            .from_reader(buffer);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows: Vec<Vec<Option<String>>> = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                record
                    .iter()
                    .map(|cell| {
                        // Multi-line cells keep inner newlines; only outer
                        // whitespace goes.
                        let trimmed = cell.trim();
                        if trimmed.is_empty() {
                            None
                        } else {
                            Some(trimmed.to_string())
                        }
                    })
                    .collect(),
            );
        }

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
            "complex-fields strategy parsed {}", filename
        );

        Ok(ExtractionResult {
            success: true,
            confidence,
            strategy: self.name().to_string(),
            metadata: ExtractionMetadata {
                delimiter: ",".to_string(),
                has_headers: true,
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
    fn test_embedded_commas_in_quotes() {
        let strategy = ComplexFieldsStrategy::new();
        let result = strategy
            .execute(
                b"name,description\n\"Widget, large\",\"Spins, wobbles\"\n",
                "quoted.csv",
            )
            .unwrap();

        assert!(result.success);
        assert_eq!(result.records[0]["name"], "Widget, large");
        assert_eq!(result.records[0]["description"], "Spins, wobbles");
    }

    #[test]
    fn test_doubled_quotes() {
        let strategy = ComplexFieldsStrategy::new();
        let result = strategy
            .execute(b"name,note\nBolt,\"the \"\"big\"\" one\"\n", "q.csv")
            .unwrap();

        assert!(result.success);
        assert_eq!(result.records[0]["note"], "the \"big\" one");
    }

    #[test]
    fn test_multiline_cell() {
        let strategy = ComplexFieldsStrategy::new();
        let result = strategy
            .execute(b"name,note\nBolt,\"line one\nline two\"\n", "ml.csv")
            .unwrap();

        assert!(result.success);
        assert_eq!(result.metadata.record_count, 1);
        let note = result.records[0]["note"].as_str().unwrap();
        assert!(note.contains("line one"));
        assert!(note.contains("line two"));
    }

    #[test]
    fn test_declines_unquoted_buffer() {
        let strategy = ComplexFieldsStrategy::new();
        assert!(!strategy.can_handle(b"a,b\n1,2\n"));
    }
}
