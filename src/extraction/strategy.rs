//! Extraction strategy interface and compile-time registry
//!
//! Strategies are registered explicitly here and ordered by priority; there
//! is no runtime discovery.

use crate::error::Result;
use crate::extraction::alternative::AlternativeDelimiterStrategy;
use crate::extraction::complex::ComplexFieldsStrategy;
use crate::extraction::dirty::DirtyRecoveryStrategy;
use crate::extraction::headerless::HeaderlessStrategy;
use crate::extraction::standard::StandardCsvStrategy;
use crate::extraction::ExtractionResult;
use std::sync::Arc;

/// One parsing heuristic competing over a raw buffer.
pub trait ExtractionStrategy: Send + Sync {
    /// Stable identifier recorded on results
    fn name(&self) -> &'static str;

    /// Higher runs earlier; specialization order, not quality order
    fn priority(&self) -> u8;

    /// Cheap applicability probe, no full parse
    fn can_handle(&self, buffer: &[u8]) -> bool;

    /// Full parse attempt
    fn execute(&self, buffer: &[u8], filename: &str) -> Result<ExtractionResult>;
}

/// All known strategies, sorted by descending priority.
pub fn strategy_registry() -> Vec<Arc<dyn ExtractionStrategy>> {
    let mut strategies: Vec<Arc<dyn ExtractionStrategy>> = vec![
        Arc::new(StandardCsvStrategy::new()),
        Arc::new(AlternativeDelimiterStrategy::new()),
        Arc::new(HeaderlessStrategy::new()),
        Arc::new(ComplexFieldsStrategy::new()),
        Arc::new(DirtyRecoveryStrategy::new()),
    ];
    strategies.sort_by(|a, b| b.priority().cmp(&a.priority()));
    strategies
}

/// Parse a buffer with the csv crate into headers plus raw rows.
///
/// Empty cells come back as `None`. With `has_headers` false the caller gets
/// positional `column_N` names.
pub fn parse_csv(
    buffer: &[u8],
    delimiter: u8,
    has_headers: bool,
) -> Result<(Vec<String>, Vec<Vec<Option<String>>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(buffer);

    let headers: Vec<String> = if has_headers {
        reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Vec<Option<String>> = record
            .iter()
            .map(|cell| {
                let trimmed = cell.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect();
        rows.push(row);
    }

    let headers = if has_headers {
        headers
    } else {
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        (1..=width).map(|i| format!("column_{}", i)).collect()
    };

    Ok((headers, rows))
}
