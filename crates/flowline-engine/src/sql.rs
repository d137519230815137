//! Shared `sqlx` plumbing for the database connector and checkpoint store

use std::collections::BTreeMap;

use flowline_common::{FlowlineError, Result};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row, ValueRef};

use crate::error::db_error;

/// SQL dialect behind an `AnyPool`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Postgres,
    Sqlite,
}

impl Provider {
    pub fn from_url(url: &str) -> Result<Self> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Provider::Postgres),
            "sqlite" => Ok(Provider::Sqlite),
            other => Err(FlowlineError::configuration(format!(
                "unsupported database provider '{}'",
                other
            ))),
        }
    }
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reject anything that is not a plain (optionally schema-qualified)
/// identifier; table and column names are interpolated into SQL.
pub fn validate_identifier(name: &str) -> Result<&str> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| is_plain_identifier(p)) {
        Ok(name)
    } else {
        Err(FlowlineError::configuration(format!(
            "invalid SQL identifier '{}'",
            name
        )))
    }
}

/// Open a small pool for `url`
pub async fn connect(url: &str, max_connections: u32) -> Result<AnyPool> {
    sqlx::any::install_default_drivers();
    Provider::from_url(url)?;
    AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(db_error)
}

/// Decode a row into JSON values, trying integer, float, bool then text
pub fn row_to_json(row: &AnyRow) -> BTreeMap<String, serde_json::Value> {
    let mut fields = BTreeMap::new();
    for (i, column) in row.columns().iter().enumerate() {
        let is_null = row.try_get_raw(i).map(|v| v.is_null()).unwrap_or(true);
        let value = if is_null {
            serde_json::Value::Null
        } else if let Ok(v) = row.try_get::<i64, _>(i) {
            serde_json::Value::from(v)
        } else if let Ok(v) = row.try_get::<i32, _>(i) {
            serde_json::Value::from(v)
        } else if let Ok(v) = row.try_get::<f64, _>(i) {
            serde_json::Number::from_f64(v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<f32, _>(i) {
            serde_json::Number::from_f64(f64::from(v))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        } else if let Ok(v) = row.try_get::<bool, _>(i) {
            serde_json::Value::Bool(v)
        } else if let Ok(v) = row.try_get::<String, _>(i) {
            serde_json::Value::String(v)
        } else {
            serde_json::Value::Null
        };
        fields.insert(column.name().to_string(), value);
    }
    fields
}
