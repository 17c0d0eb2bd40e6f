//! Alternative-delimiter strategy - semicolon/tab/pipe/colon files
//!
//! Detects the dominant non-comma delimiter by frequency over a buffer sample
//! and reparses with it. Exported European spreadsheets (`;`) are the common
//! customer here.

use crate::error::Result;
use crate::extraction::analysis::{self, BufferAnalysis};
use crate::extraction::strategy::{parse_csv, ExtractionStrategy};
use crate::extraction::{build_records, measure_quality, ExtractionMetadata, ExtractionResult};
use std::time::Instant;
use tracing::debug;

const BASE_CONFIDENCE: f64 = 80.0;
const QUALITY_ADJUSTMENT: f64 = 20.0;

/// Delimiters considered, in detection order; comma is the standard
/// strategy's territory.
const ALTERNATIVES: [char; 4] = [';', '\t', '|', ':'];

pub struct AlternativeDelimiterStrategy;

impl AlternativeDelimiterStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Pick the most frequent alternative delimiter, if any occurs at all.
    fn detect_delimiter(analysis: &BufferAnalysis) -> Option<char> {
        ALTERNATIVES
            .iter()
            .copied()
            .map(|d| (d, analysis.delimiter_counts.get(&d).copied().unwrap_or(0)))
            .filter(|&(_, count)| count > 0)
            .max_by_key(|&(_, count)| count)
            .map(|(d, _)| d)
    }
}

impl Default for AlternativeDelimiterStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for AlternativeDelimiterStrategy {
    fn name(&self) -> &'static str {
        "alternative_delimiter"
    }

    fn priority(&self) -> u8 {
        80
    }

    fn can_handle(&self, buffer: &[u8]) -> bool {
        let analysis = analysis::analyze(buffer);
        Self::detect_delimiter(&analysis).is_some()
    }

    fn execute(&self, buffer: &[u8], filename: &str) -> Result<ExtractionResult> {
        let analysis = analysis::analyze(buffer);
        let delimiter = match Self::detect_delimiter(&analysis) {
            Some(d) => d,
            None => {
                return Ok(ExtractionResult::failed(
                    self.name(),
                    "no alternative delimiter detected",
                ))
            }
        };

        let start = Instant::now();
        let (headers, rows) = parse_csv(buffer, delimiter as u8, true)?;
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
            delimiter = %delimiter,
            records = records.len(),
            "alternative-delimiter strategy parsed {}", filename
        );

        Ok(ExtractionResult {
            success: true,
            confidence,
            strategy: self.name().to_string(),
            metadata: ExtractionMetadata {
                delimiter: delimiter.to_string(),
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
    fn test_semicolon_file() {
        let strategy = AlternativeDelimiterStrategy::new();
        let result = strategy
            .execute(b"name;price\nWidget;9.99\nBolt;1.25\n", "euro.csv")
            .unwrap();

        assert!(result.success);
        assert_eq!(result.metadata.delimiter, ";");
        assert_eq!(result.metadata.record_count, 2);
        assert_eq!(result.records[0]["name"], "Widget");
    }

    #[test]
    fn test_tab_separated_file() {
        let strategy = AlternativeDelimiterStrategy::new();
        let result = strategy
            .execute(b"name\tprice\nWidget\t9.99\n", "data.tsv")
            .unwrap();

        assert!(result.success);
        assert_eq!(result.metadata.delimiter, "\t");
    }

    #[test]
    fn test_rejects_plain_comma_file() {
        let strategy = AlternativeDelimiterStrategy::new();
        assert!(!strategy.can_handle(b"a,b\n1,2\n"));
    }
}
