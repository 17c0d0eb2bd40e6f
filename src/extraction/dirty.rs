//! Dirty-recovery strategy - last-resort rescue for ragged files
//!
//! Splits lines manually on the dominant delimiter and forces every row to
//! the modal width, padding short rows and truncating long ones. Confidence
//! stays deliberately low so the import is flagged for review.

use crate::error::Result;
use crate::extraction::analysis;
use crate::extraction::strategy::ExtractionStrategy;
use crate::extraction::{build_records, ExtractionMetadata, ExtractionResult};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

const BASE_CONFIDENCE: f64 = 55.0;

/// Confidence lost per unit of row-width chaos
const RAGGEDNESS_PENALTY: f64 = 15.0;

pub struct DirtyRecoveryStrategy;

impl DirtyRecoveryStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirtyRecoveryStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionStrategy for DirtyRecoveryStrategy {
    fn name(&self) -> &'static str {
        "dirty_recovery"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn can_handle(&self, buffer: &[u8]) -> bool {
        // The floor of the strategy stack: anything with at least one line.
        !buffer.is_empty()
    }

    fn execute(&self, buffer: &[u8], filename: &str) -> Result<ExtractionResult> {
        let start = Instant::now();
        let analysis = analysis::analyze(buffer);
        let delimiter = analysis.dominant_delimiter;

        let text = String::from_utf8_lossy(buffer);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();

        if lines.is_empty() {
            return Ok(ExtractionResult::failed(
                self.name(),
                format!("no usable lines in {}", filename),
            ));
        }

        let split_rows: Vec<Vec<Option<String>>> = lines
            .iter()
            .map(|line| {
                line.split(delimiter)
                    .map(|cell| {
                        let trimmed = cell.trim().trim_matches('"').trim();
                        if trimmed.is_empty() {
                            None
                        } else {
                            Some(trimmed.to_string())
                        }
                    })
                    .collect()
            })
            .collect();

        // Force every row to the modal width.
        let mut width_freq: HashMap<usize, usize> = HashMap::new();
        for row in &split_rows {
            *width_freq.entry(row.len()).or_insert(0) += 1;
        }
        let modal_width = width_freq
            .iter()
            .max_by_key(|&(width, count)| (*count, *width))
            .map(|(&width, _)| width)
            .unwrap_or(1);

        let ragged = split_rows
            .iter()
            .filter(|r| r.len() != modal_width)
            .count();
        let ragged_ratio = ragged as f64 / split_rows.len() as f64;

        let mut issues = Vec::new();
        if ragged > 0 {
            issues.push(format!(
                "{} ragged rows forced to width {}",
                ragged, modal_width
            ));
        }

        let has_headers = analysis.header_likely;
        let mut rows_iter = split_rows.into_iter();
        let headers: Vec<String> = if has_headers {
            rows_iter
                .next()
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, cell)| cell.unwrap_or_else(|| format!("column_{}", i + 1)))
                .collect()
        } else {
            (1..=modal_width).map(|i| format!("column_{}", i)).collect()
        };

        let rows: Vec<Vec<Option<String>>> = rows_iter
            .map(|mut row| {
                row.resize(modal_width, None);
                row
            })
            .collect();

        let parse_duration_ms = start.elapsed().as_millis() as u64;

        if rows.is_empty() {
            return Ok(ExtractionResult::failed(
                self.name(),
                format!("no data rows recovered from {}", filename),
            ));
        }

        let confidence =
            (BASE_CONFIDENCE - ragged_ratio * RAGGEDNESS_PENALTY).clamp(0.0, 100.0);
        let records = build_records(&headers, &rows);
        debug!(
            records = records.len(),
            ragged, "dirty-recovery strategy rescued {}", filename
        );

        Ok(ExtractionResult {
            success: true,
            confidence,
            strategy: self.name().to_string(),
            metadata: ExtractionMetadata {
                delimiter: delimiter.to_string(),
                has_headers,
                record_count: records.len(),
                encoding: "utf-8".to_string(),
                parse_duration_ms,
                quality_score: 1.0 - ragged_ratio,
                issues,
            },
            records,
            error: None,
        })
    }
}
