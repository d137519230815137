//! Transform algebra: filter, map, flatten, aggregate
//!
//! Every operation is a pure function over records plus a thin
//! [`Transformer`](crate::connectors::Transformer) wrapper selected by the
//! step's `transformationType`.

pub mod aggregate;
pub mod filter;
pub mod flatten;
pub mod map;

use std::cmp::Ordering;

use flowline_common::types::{compare_cursors, DataRecord};

pub use aggregate::AggregateTransformer;
pub use filter::FilterTransformer;
pub use flatten::FlattenTransformer;
pub use map::MapTransformer;

/// Render a JSON value without quoting strings.
///
/// Used for grouping keys, cursors and equality checks so that `1`, `"1"`
/// and `1` from a CSV cell all compare equal.
pub fn plain_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a value; numeric strings count
pub fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Order two values: numerically when both are numeric, otherwise as
/// cursors (timestamps chronologically, then lexicographically).
pub fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => compare_cursors(&plain_string(a), &plain_string(b)),
    }
}

/// Look up a possibly dotted field path on a record
pub fn record_field<'a>(record: &'a DataRecord, path: &str) -> Option<&'a serde_json::Value> {
    if let Some(value) = record.get(path) {
        return Some(value);
    }
    let (head, rest) = path.split_once('.')?;
    crate::connectors::json_path(record.get(head)?, rest)
}

/// JSON number from an `f64`, collapsing integral values to integers
pub fn number(value: f64) -> serde_json::Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serde_json::Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}
