//! Sample-based schema inference
//!
//! Given a handful of records, decide per field whether it is required,
//! whether it holds arrays, and the narrowest common type:
//!
//! - required iff present and non-null in every sampled record
//! - array iff any sampled value is an array (element types are merged)
//! - integer + decimal merge to decimal; any other mix falls back to string
//! - strings that parse as JSON objects/arrays become json/array, RFC 3339
//!   and ISO dates become datetime

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use flowline_common::types::{DataRecord, FieldDefinition, FieldType, SchemaDefinition};

/// Type observed for a single sampled value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Null,
    Boolean,
    Integer,
    Decimal,
    DateTime,
    String,
    Json,
    Array,
    Complex,
}

impl Observed {
    fn to_field_type(self) -> FieldType {
        match self {
            Observed::Null | Observed::String => FieldType::String,
            Observed::Boolean => FieldType::Boolean,
            Observed::Integer => FieldType::Integer,
            Observed::Decimal => FieldType::Decimal,
            Observed::DateTime => FieldType::DateTime,
            Observed::Json => FieldType::Json,
            Observed::Array => FieldType::Array,
            Observed::Complex => FieldType::Complex,
        }
    }
}

/// True for RFC 3339 timestamps and plain ISO dates / date-times
pub fn looks_like_datetime(s: &str) -> bool {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn observe_string(s: &str) -> Observed {
    let trimmed = s.trim();
    if looks_like_datetime(trimmed) {
        return Observed::DateTime;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::Object(_)) => return Observed::Json,
            Ok(serde_json::Value::Array(_)) => return Observed::Array,
            _ => {},
        }
    }
    Observed::String
}

fn observe(value: &serde_json::Value) -> Observed {
    match value {
        serde_json::Value::Null => Observed::Null,
        serde_json::Value::Bool(_) => Observed::Boolean,
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Observed::Integer,
        serde_json::Value::Number(_) => Observed::Decimal,
        serde_json::Value::String(s) => observe_string(s),
        serde_json::Value::Array(_) => Observed::Array,
        serde_json::Value::Object(_) => Observed::Complex,
    }
}

fn merge(types: &[Observed]) -> FieldType {
    let non_null: Vec<Observed> = types
        .iter()
        .copied()
        .filter(|t| *t != Observed::Null)
        .collect();

    let Some(first) = non_null.first().copied() else {
        return FieldType::String;
    };
    if non_null.iter().all(|t| *t == first) {
        return first.to_field_type();
    }
    if non_null
        .iter()
        .all(|t| matches!(t, Observed::Integer | Observed::Decimal))
    {
        return FieldType::Decimal;
    }
    FieldType::String
}

#[derive(Default)]
struct FieldStats {
    present_non_null: usize,
    is_array: bool,
    observed: Vec<Observed>,
}

/// Infer a schema for `source_id` from `sample`
pub fn infer_schema(source_id: &str, sample: &[DataRecord]) -> SchemaDefinition {
    let mut stats: BTreeMap<&str, FieldStats> = BTreeMap::new();

    for record in sample {
        for (name, value) in &record.fields {
            let entry = stats.entry(name.as_str()).or_default();
            if value.is_null() {
                continue;
            }
            entry.present_non_null += 1;
            match value {
                serde_json::Value::Array(items) => {
                    entry.is_array = true;
                    entry.observed.extend(items.iter().map(observe));
                },
                other => entry.observed.push(observe(other)),
            }
        }
    }

    let fields = stats
        .into_iter()
        .map(|(name, s)| {
            let field_type = if s.is_array && s.observed.is_empty() {
                FieldType::Array
            } else {
                merge(&s.observed)
            };
            FieldDefinition {
                name: name.to_string(),
                field_type,
                is_required: !sample.is_empty() && s.present_non_null == sample.len(),
                is_array: s.is_array,
            }
        })
        .collect();

    SchemaDefinition {
        id: format!("{}-inferred", source_id),
        name: format!("{} (inferred)", source_id),
        fields,
        inferred: true,
    }
}
