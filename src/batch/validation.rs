//! Entity-specific record validation and auto-correction
//!
//! The loader hands each mapped record through here before persisting.
//! Failures are per-record and recoverable: the record is skipped with a
//! reason, an auto-fixability flag and a remediation suggestion, and the
//! batch moves on.

use crate::inference::parse_numeric;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One validation finding for one field
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
    pub auto_fixable: bool,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    fn error(field: &str, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            auto_fixable: false,
            suggestion: Some(suggestion.into()),
        }
    }

    fn fixed(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            auto_fixable: true,
            suggestion: None,
        }
    }
}

/// Outcome of validating (and possibly correcting) one record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatedRecord {
    /// The record with auto-corrections applied
    pub record: Value,

    /// Hard failures; any entry means the record must not persist
    pub errors: Vec<ValidationIssue>,

    /// Non-fatal findings about applied auto-fixes
    pub warnings: Vec<ValidationIssue>,
}

impl ValidatedRecord {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Static per-entity business rules
struct EntityRules {
    required: &'static [&'static str],
    /// Fields coerced to non-negative integer minor units
    monetary: &'static [&'static str],
    /// Fields that must parse as dates, falling back to today
    dates: &'static [&'static str],
    /// (field, allowed values, default)
    enums: &'static [(&'static str, &'static [&'static str], &'static str)],
    /// Slug field synthesized from `name` when required but absent
    slug_field: Option<&'static str>,
}

const PRODUCT_RULES: EntityRules = EntityRules {
    required: &["name", "price"],
    monetary: &["price"],
    dates: &["released_at"],
    enums: &[("status", &["active", "draft", "archived"], "draft")],
    slug_field: Some("slug"),
};

const CUSTOMER_RULES: EntityRules = EntityRules {
    required: &["name", "email"],
    monetary: &[],
    dates: &["signed_up_at"],
    enums: &[],
    slug_field: None,
};

const ORDER_RULES: EntityRules = EntityRules {
    required: &["order_number", "total"],
    monetary: &["total"],
    dates: &["ordered_at"],
    enums: &[("status", &["pending", "paid", "shipped", "cancelled"], "pending")],
    slug_field: None,
};

fn rules_for(entity_type: &str) -> Option<&'static EntityRules> {
    match entity_type {
        "product" => Some(&PRODUCT_RULES),
        "customer" => Some(&CUSTOMER_RULES),
        "order" => Some(&ORDER_RULES),
        _ => None,
    }
}

/// Whether this entity type has a rule set at all.
pub fn known_entity(entity_type: &str) -> bool {
    rules_for(entity_type).is_some()
}

fn is_present(record: &Value, field: &str) -> bool {
    match record.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Validate one mapped record against its entity's rules, applying
/// auto-corrections in place on the returned copy.
pub fn validate_record(entity_type: &str, record: &Value) -> ValidatedRecord {
    let rules = match rules_for(entity_type) {
        Some(rules) => rules,
        None => {
            return ValidatedRecord {
                record: record.clone(),
                errors: vec![ValidationIssue::error(
                    "",
                    format!("unknown entity type: {}", entity_type),
                    "use one of: product, customer, order",
                )],
                warnings: Vec::new(),
            }
        }
    };

    let mut record = record.clone();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for field in rules.required {
        if !is_present(&record, field) {
            errors.push(ValidationIssue::error(
                field,
                format!("required field {} is missing or empty", field),
                format!("map a source column to {}", field),
            ));
        }
    }

    if let Some(obj) = record.as_object_mut() {
        // Monetary fields: coerce to integer minor units, force non-negative.
        for field in rules.monetary {
            if let Some(value) = obj.get(*field) {
                if value.is_null() {
                    continue;
                }
                let parsed = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => parse_numeric(s),
                    _ => None,
                };
                match parsed {
                    Some(amount) => {
                        if amount < 0.0 {
                            warnings.push(ValidationIssue::fixed(
                                field,
                                format!("negative amount {} flipped to positive", amount),
                            ));
                        }
                        let minor_units = (amount.abs() * 100.0).round() as i64;
                        obj.insert(field.to_string(), Value::Number(minor_units.into()));
                    }
                    None => {
                        errors.push(ValidationIssue::error(
                            field,
                            format!("{} is not a monetary value", field),
                            "provide a numeric amount, currency symbols are accepted",
                        ));
                    }
                }
            }
        }

        // Date fields: unparseable values fall back to today with a warning.
        for field in rules.dates {
            if let Some(Value::String(s)) = obj.get(*field) {
                let s = s.trim().to_string();
                if !s.is_empty() && parse_date(&s).is_none() {
                    let today = Utc::now().date_naive().to_string();
                    warnings.push(ValidationIssue::fixed(
                        field,
                        format!("unparseable date {:?} replaced with {}", s, today),
                    ));
                    obj.insert(field.to_string(), Value::String(today));
                }
            }
        }

        // Enumerations: unknown values fall back to the safe default.
        for (field, allowed, default) in rules.enums {
            if let Some(Value::String(s)) = obj.get(*field) {
                let lowered = s.trim().to_lowercase();
                if !lowered.is_empty() && !allowed.contains(&lowered.as_str()) {
                    warnings.push(ValidationIssue::fixed(
                        field,
                        format!("value {:?} not in {:?}, defaulted to {:?}", s, allowed, default),
                    ));
                    obj.insert(field.to_string(), Value::String(default.to_string()));
                } else if !lowered.is_empty() {
                    obj.insert(field.to_string(), Value::String(lowered));
                }
            }
        }

        // Slug synthesis from name.
        if let Some(slug_field) = rules.slug_field {
            let missing = !is_present(&Value::Object(obj.clone()), slug_field);
            if missing {
                if let Some(Value::String(name)) = obj.get("name") {
                    let slug = slugify(name);
                    if !slug.is_empty() {
                        warnings.push(ValidationIssue::fixed(
                            slug_field,
                            format!("slug generated from name: {}", slug),
                        ));
                        obj.insert(slug_field.to_string(), Value::String(slug));
                    }
                }
            }
        }
    }

    ValidatedRecord {
        record,
        errors,
        warnings,
    }
}

fn parse_date(value: &str) -> Option<chrono::NaiveDate> {
    const FORMATS: [&str; 4] = ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d"];
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    FORMATS
        .iter()
        .find_map(|fmt| chrono::NaiveDate::parse_from_str(value, fmt).ok())
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_dash = true;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}
