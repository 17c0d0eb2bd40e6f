//! Standard strategy - RFC-ish comma-delimited parse
//!
//! The default path for well-behaved uploads. Column-count tolerance is
//! relaxed (flexible reader) but a parse producing zero records fails closed.

use crate::error::Result;
use crate::extraction::strategy::{parse_csv, ExtractionStrategy};
use crate::extraction::{build_records, measure_quality, ExtractionMetadata, ExtractionResult};
use std::time::Instant;
use tracing::debug;

/// Baseline confidence for a clean comma-delimited parse
pub const BASE_CONFIDENCE: f64 = 85.0;

/// Quality swing applied around the baseline
const QUALITY_ADJUSTMENT: f64 = 20.0;

/// Parses slower than this lose a few points
const SLOW_PARSE_MS: u64 = 1_000;
const SLOW_PARSE_PENALTY: f64 = 5.0;

/// Ceiling for parses that found a single column
const SINGLE_COLUMN_CAP: f64 = 40.0;

pub struct StandardCsvStrategy;

impl StandardCsvStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StandardCsvStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for StandardCsvStrategy {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn priority(&self) -> u8 {
        100
    }

    fn can_handle(&self, buffer: &[u8]) -> bool {
        // Any buffer with at least one comma on the first line is worth a try.
        let window = &buffer[..buffer.len().min(4096)];
        String::from_utf8_lossy(window)
            .lines()
            .next()
            .map(|l| l.contains(','))
            .unwrap_or(false)
    }

    fn execute(&self, buffer: &[u8], filename: &str) -> Result<ExtractionResult> {
        let start = Instant::now();
        let (headers, rows) = parse_csv(buffer, b',', true)?;
        let parse_duration_ms = start.elapsed().as_millis() as u64;

        if rows.is_empty() {
            return Ok(ExtractionResult::failed(
                self.name(),
                format!("no records parsed from {}", filename),
            ));
        }

        let (quality, mut issues) = measure_quality(&rows, headers.len());
        let mut confidence = BASE_CONFIDENCE + (quality - 0.5) * QUALITY_ADJUSTMENT;
        if parse_duration_ms > SLOW_PARSE_MS {
            confidence -= SLOW_PARSE_PENALTY;
        }
        // A one-column "parse" usually means the delimiter was wrong.
        if headers.len() < 2 {
            issues.push("only one column detected".to_string());
            confidence = confidence.min(SINGLE_COLUMN_CAP);
        }
        let confidence = confidence.clamp(0.0, 100.0);

        let records = build_records(&headers, &rows);
        debug!(
            records = records.len(),
            confidence, "standard strategy parsed {}", filename
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
    fn test_clean_csv_clears_base_confidence() {
        let strategy = StandardCsvStrategy::new();
        let result = strategy
            .execute(b"name,price\nWidget,9.99\nBolt,1.25\n", "test.csv")
            .unwrap();

        assert!(result.success);
        assert!(result.confidence >= BASE_CONFIDENCE);
        assert!(result.metadata.has_headers);
        assert_eq!(result.metadata.record_count, 2);
        assert!(result.records[0].get("name").is_some());
        assert!(result.records[0].get("price").is_some());
    }

    #[test]
    fn test_zero_records_fails_closed() {
        let strategy = StandardCsvStrategy::new();
        let result = strategy.execute(b"name,price\n", "empty.csv").unwrap();
        assert!(!result.success);
        assert!(result.records.is_empty());
    }

    #[test]
    fn test_can_handle_requires_commas() {
        let strategy = StandardCsvStrategy::new();
        assert!(strategy.can_handle(b"a,b\n1,2\n"));
        assert!(!strategy.can_handle(b"a;b\n1;2\n"));
    }
}
