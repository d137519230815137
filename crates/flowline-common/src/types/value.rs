//! Schema-less configuration values
//!
//! Step and connector configuration arrives as arbitrary JSON-like data.
//! [`ConfigValue`] keeps that flexibility behind an explicit tagged union so
//! connectors read typed values instead of poking at raw JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FlowlineError, Result};

/// A configuration mapping (step configuration, global configuration, ...)
pub type Configuration = BTreeMap<String, ConfigValue>;

/// Configuration value: string, number, bool, map, list or null
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum ConfigValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ConfigValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Booleans, plus the strings "true"/"false" which show up in
    /// environment-sourced configuration.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Number(n) => n.as_i64(),
            ConfigValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::Number(n) => n.as_u64(),
            ConfigValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Number(n) => n.as_f64(),
            ConfigValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Render scalars as plain strings (no JSON quoting).
    pub fn to_plain_string(&self) -> String {
        match self {
            ConfigValue::Null => String::new(),
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Number(n) => n.to_string(),
            ConfigValue::String(s) => s.clone(),
            other => serde_json::Value::from(other.clone()).to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.clone())
    }
}

impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ConfigValue::Null,
            serde_json::Value::Bool(b) => ConfigValue::Bool(b),
            serde_json::Value::Number(n) => ConfigValue::Number(n),
            serde_json::Value::String(s) => ConfigValue::String(s),
            serde_json::Value::Array(items) => {
                ConfigValue::List(items.into_iter().map(ConfigValue::from).collect())
            },
            serde_json::Value::Object(map) => ConfigValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ConfigValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<ConfigValue> for serde_json::Value {
    fn from(value: ConfigValue) -> Self {
        match value {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(b) => serde_json::Value::Bool(b),
            ConfigValue::Number(n) => serde_json::Value::Number(n),
            ConfigValue::String(s) => serde_json::Value::String(s),
            ConfigValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            },
            ConfigValue::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<i64> for ConfigValue {
    fn from(n: i64) -> Self {
        ConfigValue::Number(n.into())
    }
}

impl From<u64> for ConfigValue {
    fn from(n: u64) -> Self {
        ConfigValue::Number(n.into())
    }
}

/// Typed lookups on a [`Configuration`] mapping
pub trait ConfigurationExt {
    fn value(&self, key: &str) -> Option<&ConfigValue>;

    fn get_str(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(ConfigValue::as_str)
    }

    /// Required string entry; a missing or empty value is a configuration error.
    fn require_str(&self, key: &str) -> Result<&str> {
        match self.get_str(key) {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(FlowlineError::configuration(format!(
                "missing required configuration key '{}'",
                key
            ))),
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.value(key).and_then(ConfigValue::as_bool)
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.value(key).and_then(ConfigValue::as_u64)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.value(key).and_then(ConfigValue::as_f64)
    }

    fn get_map(&self, key: &str) -> Option<&BTreeMap<String, ConfigValue>> {
        self.value(key).and_then(ConfigValue::as_map)
    }

    fn get_list(&self, key: &str) -> Option<&[ConfigValue]> {
        self.value(key).and_then(ConfigValue::as_list)
    }

    /// A list of strings; a single string is accepted as a one-element list
    /// and comma-separated strings are split.
    fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.value(key) {
            Some(ConfigValue::List(items)) => items
                .iter()
                .filter(|v| !v.is_null())
                .map(ConfigValue::to_plain_string)
                .collect(),
            Some(ConfigValue::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl ConfigurationExt for BTreeMap<String, ConfigValue> {
    fn value(&self, key: &str) -> Option<&ConfigValue> {
        self.get(key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_value_from_json() {
        let value: ConfigValue = serde_json::from_value(json!({
            "url": "https://api.example.com",
            "retries": 3,
            "verbose": true,
            "tags": ["a", "b"],
            "extra": null
        }))
        .unwrap();

        let map = value.as_map().unwrap();
        assert_eq!(map.get_str("url"), Some("https://api.example.com"));
        assert_eq!(map.get_u64("retries"), Some(3));
        assert_eq!(map.get_bool("verbose"), Some(true));
        assert_eq!(map.get_string_list("tags"), vec!["a", "b"]);
        assert!(map.value("extra").unwrap().is_null());
    }

    #[test]
    fn test_config_value_round_trips_through_json() {
        let original = json!({"nested": {"x": 1.5, "y": [1, "two", false]}});
        let value = ConfigValue::from(original.clone());
        assert_eq!(value.to_json(), original);
    }

    #[test]
    fn test_require_str_rejects_missing_and_blank() {
        let mut config = Configuration::new();
        config.insert("blank".into(), "  ".into());
        assert!(config.require_str("missing").is_err());
        assert!(config.require_str("blank").is_err());
    }

    #[test]
    fn test_string_list_accepts_comma_separated() {
        let mut config = Configuration::new();
        config.insert("groupBy".into(), "region, country".into());
        assert_eq!(config.get_string_list("groupBy"), vec!["region", "country"]);
    }
}
