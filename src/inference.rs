//! Field Inference Engine - per-column structure and type detection
//!
//! Consumes the records an extraction produced and derives, per column:
//! inferred primitive type, null and uniqueness ratios, semantic hints,
//! detected value patterns, an abbreviation-expanded semantic name and
//! summary statistics. The resulting report is what field-mapping UIs and
//! the learning store work from.

use crate::extraction::ExtractionResult;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Share of non-null values a type probe must pass to win the column
pub const TYPE_PROBE_THRESHOLD: f64 = 0.8;

/// Columns with null% below this are considered required
pub const REQUIRED_NULL_THRESHOLD: f64 = 10.0;

/// Distinct sample values kept per field
pub const SAMPLE_VALUE_LIMIT: usize = 5;

/// Rows included in the report's sample matrix
pub const SAMPLE_ROW_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Json,
}

/// Summary statistics for one column
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldStats {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_numeric: Option<f64>,
    pub max_numeric: Option<f64>,
    pub mean_numeric: Option<f64>,
}

/// Everything inference learned about one source column
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,

    /// Abbreviation-expanded, normalized name used by the learning store
    pub semantic_name: String,

    pub inferred_type: FieldType,

    /// Business-level subtype hint: currency, percentage, email, sku, ...
    pub semantic_hint: Option<String>,

    /// Bounded set of distinct example values
    pub sample_values: Vec<String>,

    pub null_percentage: f64,
    pub uniqueness_percentage: f64,

    /// Derived: null% below [`REQUIRED_NULL_THRESHOLD`]
    pub required: bool,

    /// Named value patterns detected in the data
    pub patterns: Vec<String>,

    pub stats: FieldStats,
}

/// Structural report over one extraction pass
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StructureReport {
    pub fields: Vec<FieldDescriptor>,
    pub sample_rows: Vec<Value>,
    pub record_count: usize,

    /// Overall confidence in [0, 1] that the structure is well understood
    pub confidence: f64,
}

/// Known abbreviation expansions for field-name tokens
const ABBREVIATIONS: [(&str, &str); 16] = [
    ("qty", "quantity"),
    ("desc", "description"),
    ("amt", "amount"),
    ("num", "number"),
    ("no", "number"),
    ("addr", "address"),
    ("tel", "telephone"),
    ("img", "image"),
    ("pic", "picture"),
    ("cat", "category"),
    ("pct", "percent"),
    ("avg", "average"),
    ("min", "minimum"),
    ("max", "maximum"),
    ("std", "standard"),
    ("ref", "reference"),
];

/// Name fragments mapped to semantic hints, checked in order
const NAME_HINTS: [(&str, &str); 18] = [
    ("price", "currency"),
    ("cost", "currency"),
    ("amount", "currency"),
    ("total", "currency"),
    ("revenue", "currency"),
    ("fee", "currency"),
    ("percent", "percentage"),
    ("rate", "percentage"),
    ("email", "email"),
    ("phone", "phone"),
    ("mobile", "phone"),
    ("url", "url"),
    ("website", "url"),
    ("image", "image"),
    ("photo", "image"),
    ("sku", "sku"),
    ("barcode", "barcode"),
    ("quantity", "quantity"),
];

const BOOLEAN_TOKENS: [&str; 10] = ["true", "false", "yes", "no", "y", "n", "t", "f", "1", "0"];

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%Y-%m-%d %H:%M:%S",
];

/// Field Inference Engine
pub struct FieldInferenceEngine {
    hex_color: Regex,
    email: Regex,
    url: Regex,
    barcode: Regex,
    structured_code: Regex,
}

impl FieldInferenceEngine {
    pub fn new() -> Self {
        // The patterns are literals; compilation cannot fail.
        Self {
            hex_color: Regex::new(r"^#[0-9a-fA-F]{6}$").unwrap(),
            email: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap(),
            url: Regex::new(r"^https?://\S+$").unwrap(),
            barcode: Regex::new(r"^\d{8}$|^\d{12,14}$").unwrap(),
            structured_code: Regex::new(r"^[A-Z]{2,4}-\d+$").unwrap(),
        }
    }

    /// Analyze an extraction's records into a structure report.
    pub fn analyze(&self, extraction: &ExtractionResult) -> StructureReport {
        self.analyze_records(&extraction.records)
    }

    pub fn analyze_records(&self, records: &[Value]) -> StructureReport {
        let columns = column_order(records);
        let fields: Vec<FieldDescriptor> = columns
            .iter()
            .map(|name| self.describe_field(name, records))
            .collect();

        let sample_rows: Vec<Value> = records.iter().take(SAMPLE_ROW_LIMIT).cloned().collect();
        let confidence = report_confidence(&fields);
        debug!(
            fields = fields.len(),
            confidence, "inferred structure over {} records", records.len()
        );

        StructureReport {
            fields,
            sample_rows,
            record_count: records.len(),
            confidence,
        }
    }

    fn describe_field(&self, name: &str, records: &[Value]) -> FieldDescriptor {
        let total = records.len();
        let raw_values: Vec<Option<String>> = records
            .iter()
            .map(|r| r.get(name).and_then(value_as_text))
            .collect();

        let non_null: Vec<&String> = raw_values.iter().flatten().collect();
        let null_percentage = if total > 0 {
            (total - non_null.len()) as f64 / total as f64 * 100.0
        } else {
            100.0
        };

        let distinct: Vec<&String> = non_null.iter().copied().unique().collect();
        let uniqueness_percentage = if non_null.is_empty() {
            0.0
        } else {
            distinct.len() as f64 / non_null.len() as f64 * 100.0
        };

        let inferred_type = infer_type(&non_null);
        let patterns = self.detect_patterns(&non_null);
        let semantic_hint = self
            .hint_from_name(name)
            .or_else(|| self.hint_from_values(&patterns, &non_null, inferred_type));

        let sample_values: Vec<String> = distinct
            .iter()
            .take(SAMPLE_VALUE_LIMIT)
            .map(|s| s.to_string())
            .collect();

        FieldDescriptor {
            name: name.to_string(),
            semantic_name: expand_abbreviations(name),
            inferred_type,
            semantic_hint,
            sample_values,
            null_percentage,
            uniqueness_percentage,
            required: null_percentage < REQUIRED_NULL_THRESHOLD,
            patterns,
            stats: field_stats(&non_null),
        }
    }

    fn hint_from_name(&self, name: &str) -> Option<String> {
        let lowered = expand_abbreviations(name);
        NAME_HINTS
            .iter()
            .find(|(fragment, _)| lowered.contains(fragment))
            .map(|(_, hint)| hint.to_string())
    }

    fn hint_from_values(
        &self,
        patterns: &[String],
        values: &[&String],
        inferred_type: FieldType,
    ) -> Option<String> {
        for pattern in patterns {
            let hint = match pattern.as_str() {
                "hex_color" => Some("color"),
                "email_format" => Some("email"),
                "url_format" => Some("url"),
                "barcode_length" => Some("barcode"),
                "structured_code" => Some("sku"),
                _ => None,
            };
            if let Some(hint) = hint {
                return Some(hint.to_string());
            }
        }

        if inferred_type == FieldType::Number && !values.is_empty() {
            if values.iter().all(|v| has_currency_symbol(v)) {
                return Some("currency".to_string());
            }
            if values.iter().all(|v| v.trim().ends_with('%')) {
                return Some("percentage".to_string());
            }
        }
        None
    }

    /// Named patterns that hold for every non-null value of a column.
    fn detect_patterns(&self, values: &[&String]) -> Vec<String> {
        if values.is_empty() {
            return Vec::new();
        }

        let probes: [(&Regex, &str); 5] = [
            (&self.hex_color, "hex_color"),
            (&self.email, "email_format"),
            (&self.url, "url_format"),
            (&self.barcode, "barcode_length"),
            (&self.structured_code, "structured_code"),
        ];

        let mut patterns = Vec::new();
        for (regex, label) in probes {
            if values.iter().all(|v| regex.is_match(v.trim())) {
                patterns.push(label.to_string());
            }
        }
        if values.iter().all(|v| has_currency_symbol(v)) {
            patterns.push("currency_symbol".to_string());
        }
        patterns
    }
}

impl Default for FieldInferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Column names in first-seen order across all records.
fn column_order(records: &[Value]) -> Vec<String> {
    let mut seen = Vec::new();
    for record in records {
        if let Some(obj) = record.as_object() {
            for key in obj.keys() {
                if !seen.contains(key) {
                    seen.push(key.clone());
                }
            }
        }
    }
    seen
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn has_currency_symbol(value: &str) -> bool {
    let t = value.trim();
    t.starts_with(['$', '€', '£', '¥', '₹'])
        || t.ends_with(['$', '€', '£', '¥', '₹'])
}

/// Parse a cell as a number, tolerating currency symbols, percent signs and
/// thousands separators.
pub fn parse_numeric(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .trim_start_matches(['$', '€', '£', '¥', '₹'])
        .trim_end_matches(['$', '€', '£', '¥', '₹', '%'])
        .replace(',', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn is_boolean(value: &str) -> bool {
    BOOLEAN_TOKENS.contains(&value.trim().to_lowercase().as_str())
}

fn is_date(value: &str) -> bool {
    let trimmed = value.trim();
    if chrono::DateTime::parse_from_rfc3339(trimmed).is_ok() {
        return true;
    }
    DATE_FORMATS.iter().any(|fmt| {
        chrono::NaiveDate::parse_from_str(trimmed, fmt).is_ok()
            || chrono::NaiveDateTime::parse_from_str(trimmed, fmt).is_ok()
    })
}

fn is_json(value: &str) -> bool {
    let trimmed = value.trim();
    (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(trimmed).is_ok()
}

/// Run the ordered type probes; a probe wins when it passes for at least
/// [`TYPE_PROBE_THRESHOLD`] of non-null values.
fn infer_type(values: &[&String]) -> FieldType {
    if values.is_empty() {
        return FieldType::String;
    }
    let total = values.len() as f64;
    let passes = |probe: &dyn Fn(&str) -> bool| -> bool {
        values.iter().filter(|v| probe(v)).count() as f64 / total >= TYPE_PROBE_THRESHOLD
    };

    if passes(&|v| parse_numeric(v).is_some()) {
        FieldType::Number
    } else if passes(&is_boolean) {
        FieldType::Boolean
    } else if passes(&is_date) {
        FieldType::Date
    } else if passes(&is_json) {
        FieldType::Json
    } else {
        FieldType::String
    }
}

fn field_stats(values: &[&String]) -> FieldStats {
    if values.is_empty() {
        return FieldStats::default();
    }

    let lengths: Vec<usize> = values.iter().map(|v| v.len()).collect();
    let numerics: Vec<f64> = values.iter().filter_map(|v| parse_numeric(v)).collect();

    let mean_numeric = if numerics.is_empty() {
        None
    } else {
        Some(numerics.iter().sum::<f64>() / numerics.len() as f64)
    };

    FieldStats {
        min_length: lengths.iter().min().copied(),
        max_length: lengths.iter().max().copied(),
        min_numeric: numerics.iter().copied().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.min(v)))
        }),
        max_numeric: numerics.iter().copied().fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        }),
        mean_numeric,
    }
}

/// Expand known abbreviations in a field name and normalize separators.
///
/// `unitQty` / `unit-qty` / `UNIT_QTY` all become `unit_quantity`.
pub fn expand_abbreviations(name: &str) -> String {
    let tokens = tokenize_name(name);
    tokens
        .iter()
        .map(|token| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == token.as_str())
                .map(|(_, full)| full.to_string())
                .unwrap_or_else(|| token.clone())
        })
        .join("_")
}

/// Split a field name on separators and camelCase boundaries, lowercased.
fn tokenize_name(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == ' ' || ch == '.' {
            if !current.is_empty() {
                tokens.push(current.to_lowercase());
                current = String::new();
            }
        } else if ch.is_uppercase() && !current.is_empty()
            && current.chars().last().map(|c| c.is_lowercase()).unwrap_or(false)
        {
            tokens.push(current.to_lowercase());
            current = ch.to_string();
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        tokens.push(current.to_lowercase());
    }
    tokens
}

/// Overall report confidence: base 0.5, boosted by well-named fields and
/// type diversity, penalized by average null ratio.
fn report_confidence(fields: &[FieldDescriptor]) -> f64 {
    if fields.is_empty() {
        return 0.0;
    }

    let well_named = fields
        .iter()
        .filter(|f| !f.name.starts_with("column_") && f.name.len() > 1)
        .count() as f64
        / fields.len() as f64;

    let type_diversity = fields
        .iter()
        .map(|f| f.inferred_type)
        .unique()
        .count() as f64;
    let diversity_bonus = (type_diversity / 3.0).min(1.0) * 0.1;

    let avg_null = fields.iter().map(|f| f.null_percentage).sum::<f64>()
        / fields.len() as f64
        / 100.0;

    (0.5 + well_named * 0.25 + diversity_bonus - avg_null * 0.25).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> FieldInferenceEngine {
        FieldInferenceEngine::new()
    }

    #[test]
    fn test_currency_column() {
        let records = vec![
            json!({"price": "$9.99"}),
            json!({"price": "$1.25"}),
            json!({"price": "$12.00"}),
            json!({"price": null}),
        ];
        let report = engine().analyze_records(&records);
        let field = &report.fields[0];

        assert_eq!(field.inferred_type, FieldType::Number);
        assert_eq!(field.semantic_hint.as_deref(), Some("currency"));
        // 1 null of 4 rows: exactly 25%.
        assert!((field.null_percentage - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_null_percentage_exact() {
        let records = vec![
            json!({"v": "1"}),
            json!({"v": null}),
            json!({"v": "2"}),
            json!({"v": null}),
            json!({"v": "3"}),
        ];
        let report = engine().analyze_records(&records);
        let expected = (5.0 - 3.0) / 5.0 * 100.0;
        assert!((report.fields[0].null_percentage - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_boolean_and_date_columns() {
        let records = vec![
            json!({"active": "yes", "created": "2024-01-01"}),
            json!({"active": "no", "created": "2024-02-15"}),
            json!({"active": "yes", "created": "2024-03-20"}),
        ];
        let report = engine().analyze_records(&records);
        let active = report.fields.iter().find(|f| f.name == "active").unwrap();
        let created = report.fields.iter().find(|f| f.name == "created").unwrap();

        assert_eq!(active.inferred_type, FieldType::Boolean);
        assert_eq!(created.inferred_type, FieldType::Date);
    }

    #[test]
    fn test_type_threshold_defaults_to_string() {
        // 2 of 4 numeric: below the 80% bar.
        let records = vec![
            json!({"v": "1"}),
            json!({"v": "2"}),
            json!({"v": "apple"}),
            json!({"v": "pear"}),
        ];
        let report = engine().analyze_records(&records);
        assert_eq!(report.fields[0].inferred_type, FieldType::String);
    }

    #[test]
    fn test_abbreviation_expansion() {
        assert_eq!(expand_abbreviations("unit_qty"), "unit_quantity");
        assert_eq!(expand_abbreviations("itemDesc"), "item_description");
        assert_eq!(expand_abbreviations("Order-No"), "order_number");
        assert_eq!(expand_abbreviations("name"), "name");
    }

    #[test]
    fn test_required_flag_from_null_ratio() {
        let mut records: Vec<Value> = (0..20).map(|i| json!({"v": i.to_string()})).collect();
        records.push(json!({ "v": null }));
        let report = engine().analyze_records(&records);
        // ~4.8% nulls: required.
        assert!(report.fields[0].required);
    }

    #[test]
    fn test_email_pattern_and_hint() {
        let records = vec![
            json!({"contact": "a@example.com"}),
            json!({"contact": "b@example.org"}),
        ];
        let report = engine().analyze_records(&records);
        let field = &report.fields[0];
        assert!(field.patterns.contains(&"email_format".to_string()));
        assert_eq!(field.semantic_hint.as_deref(), Some("email"));
    }

    #[test]
    fn test_generic_columns_lower_confidence() {
        let named = engine().analyze_records(&[
            json!({"name": "a", "price": "1"}),
            json!({"name": "b", "price": "2"}),
        ]);
        let generic = engine().analyze_records(&[
            json!({"column_1": "a", "column_2": "1"}),
            json!({"column_1": "b", "column_2": "2"}),
        ]);
        assert!(named.confidence > generic.confidence);
    }

    #[test]
    fn test_sample_values_bounded_and_distinct() {
        let records: Vec<Value> = (0..50).map(|i| json!({"v": (i % 10).to_string()})).collect();
        let report = engine().analyze_records(&records);
        assert_eq!(report.fields[0].sample_values.len(), SAMPLE_VALUE_LIMIT);
        assert_eq!(report.sample_rows.len(), SAMPLE_ROW_LIMIT);
    }
}
