//! Upload ingestion boundary - file-kind sniffing and format dispatch
//!
//! The caller hands over a raw byte buffer, an optional declared kind and a
//! filename hint. Multipart decoding and authentication happen upstream;
//! this layer only decides which extraction path the bytes take.

use crate::error::{ImportError, Result};
use crate::extraction::{AdaptiveExtractor, ExtractionMetadata, ExtractionResult, ExtractorConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Confidence attached to a structurally valid JSON upload
const JSON_CONFIDENCE: f64 = 95.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Csv,
    Json,
    Spreadsheet,
}

/// Decide what kind of file this is from the filename extension, falling
/// back to content sniffing.
pub fn sniff_file_kind(filename: &str, buffer: &[u8]) -> FileKind {
    let lower = filename.to_lowercase();
    if lower.ends_with(".json") || lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
        return FileKind::Json;
    }
    if lower.ends_with(".xlsx") || lower.ends_with(".xls") || lower.ends_with(".ods") {
        return FileKind::Spreadsheet;
    }
    if lower.ends_with(".csv") || lower.ends_with(".tsv") || lower.ends_with(".txt") {
        return FileKind::Csv;
    }

    // Content sniff: zip magic means a binary spreadsheet container, a
    // leading bracket or brace means JSON.
    if buffer.starts_with(b"PK") {
        return FileKind::Spreadsheet;
    }
    match buffer.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'[') | Some(b'{') => FileKind::Json,
        _ => FileKind::Csv,
    }
}

/// Extract a dataset from an uploaded buffer.
///
/// The declared kind wins over sniffing when provided. JSON uploads decode
/// directly; CSV and unknown text go through the adaptive extractor; binary
/// spreadsheets are rejected with an actionable message.
pub async fn extract_dataset(
    buffer: &[u8],
    declared_kind: Option<FileKind>,
    filename: &str,
    config: &ExtractorConfig,
) -> Result<ExtractionResult> {
    let kind = declared_kind.unwrap_or_else(|| sniff_file_kind(filename, buffer));
    debug!(?kind, "dispatching upload {}", filename);

    match kind {
        FileKind::Json => extract_json(buffer, filename),
        FileKind::Spreadsheet => Err(ImportError::Extraction(format!(
            "{} is a binary spreadsheet; export it as CSV and re-upload",
            filename
        ))),
        FileKind::Csv => {
            let extractor = AdaptiveExtractor::with_config(config.clone());
            extractor.extract(buffer, filename).await
        }
    }
}

/// Decode a JSON upload: either an array of objects or object-per-line.
fn extract_json(buffer: &[u8], filename: &str) -> Result<ExtractionResult> {
    let text = String::from_utf8_lossy(buffer);

    let records: Vec<Value> = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Object(obj)) => vec![Value::Object(obj)],
        _ => {
            // Not one document; try JSON lines.
            let mut records = Vec::new();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let value: Value = serde_json::from_str(line).map_err(|e| {
                    ImportError::Extraction(format!("{} is not valid JSON: {}", filename, e))
                })?;
                records.push(value);
            }
            records
        }
    };

    if records.is_empty() {
        return Err(ImportError::Extraction(format!(
            "{} contained no records",
            filename
        )));
    }
    if !records.iter().all(|r| r.is_object()) {
        return Err(ImportError::Extraction(format!(
            "{} is JSON but not tabular (expected objects)",
            filename
        )));
    }

    info!(records = records.len(), "decoded JSON upload {}", filename);
    let record_count = records.len();
    Ok(ExtractionResult {
        success: true,
        records,
        confidence: JSON_CONFIDENCE,
        strategy: "json".to_string(),
        metadata: ExtractionMetadata {
            delimiter: String::new(),
            has_headers: true,
            record_count,
            encoding: "utf-8".to_string(),
            parse_duration_ms: 0,
            quality_score: 1.0,
            issues: Vec::new(),
        },
        error: None,
    })
}
