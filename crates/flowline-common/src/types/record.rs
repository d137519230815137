//! Records, data sources and schemas

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version tag stamped on freshly created records
pub const INITIAL_RECORD_VERSION: &str = "1";

/// A single record flowing through a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: String,
    pub schema_id: Option<String>,
    pub source_id: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: String,
}

impl DataRecord {
    /// Create a record with a fresh id
    pub fn new(source_id: impl Into<String>, fields: BTreeMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            schema_id: None,
            source_id: source_id.into(),
            fields,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            version: INITIAL_RECORD_VERSION.to_string(),
        }
    }

    /// Build a record from a JSON value. Objects become the field map;
    /// anything else is wrapped under a single `value` field.
    pub fn from_json(source_id: impl Into<String>, value: serde_json::Value) -> Self {
        let fields = match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            other => BTreeMap::from([("value".to_string(), other)]),
        };
        Self::new(source_id, fields)
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// Present and not null
    pub fn has_value(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|v| !v.is_null())
    }

    pub fn set(&mut self, field: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(field.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn remove(&mut self, field: &str) -> Option<serde_json::Value> {
        let removed = self.fields.remove(field);
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Field map as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Derive a record from this one, keeping identity and provenance but
    /// replacing the field map.
    pub fn with_fields(&self, fields: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            fields,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Definition of an external data source or sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceDefinition {
    pub id: String,
    pub name: String,
    /// Connector type tag, e.g. "rest", "database", "filesystem", "streaming"
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub connection_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub schema: Option<SchemaDefinition>,
}

impl DataSourceDefinition {
    pub fn new(id: impl Into<String>, source_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source_type: source_type.into(),
            connection_properties: BTreeMap::new(),
            schema: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.connection_properties.get(key).map(String::as_str)
    }
}

/// Primitive or structural type of a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Decimal,
    Boolean,
    DateTime,
    Json,
    Array,
    Complex,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "boolean",
            FieldType::DateTime => "datetime",
            FieldType::Json => "json",
            FieldType::Array => "array",
            FieldType::Complex => "complex",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Decimal)
    }
}

impl std::str::FromStr for FieldType {
    type Err = crate::error::FlowlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" | "text" => Ok(FieldType::String),
            "integer" | "int" | "long" => Ok(FieldType::Integer),
            "decimal" | "number" | "double" | "float" => Ok(FieldType::Decimal),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "datetime" | "timestamp" | "date" => Ok(FieldType::DateTime),
            "json" | "object" => Ok(FieldType::Json),
            "array" | "list" => Ok(FieldType::Array),
            "complex" => Ok(FieldType::Complex),
            other => Err(crate::error::FlowlineError::configuration(format!(
                "unknown field type '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single field of a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    pub is_required: bool,
    pub is_array: bool,
}

/// Declared or inferred record schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    pub id: String,
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    /// True when produced by sampling rather than declared
    #[serde(default)]
    pub inferred: bool,
}

impl SchemaDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_from_json_object() {
        let record = DataRecord::from_json("orders", json!({"id": 1, "status": "active"}));
        assert_eq!(record.source_id, "orders");
        assert_eq!(record.get("status"), Some(&json!("active")));
        assert_eq!(record.version, INITIAL_RECORD_VERSION);
    }

    #[test]
    fn test_record_from_scalar_wraps_value() {
        let record = DataRecord::from_json("stream", json!(42));
        assert_eq!(record.get("value"), Some(&json!(42)));
    }

    #[test]
    fn test_has_value_treats_null_as_missing() {
        let record = DataRecord::from_json("s", json!({"a": null, "b": 0}));
        assert!(!record.has_value("a"));
        assert!(record.has_value("b"));
        assert!(!record.has_value("c"));
    }

    #[test]
    fn test_data_source_definition_deserializes_camel_case() {
        let def: DataSourceDefinition = serde_json::from_value(json!({
            "id": "kafka-orders",
            "name": "Orders topic",
            "type": "streaming",
            "connectionProperties": {"topic": "orders", "groupId": "flowline"}
        }))
        .unwrap();

        assert_eq!(def.source_type, "streaming");
        assert_eq!(def.property("topic"), Some("orders"));
        assert!(def.schema.is_none());
    }

    #[test]
    fn test_field_type_parsing() {
        assert_eq!("INT".parse::<FieldType>().unwrap(), FieldType::Integer);
        assert_eq!("timestamp".parse::<FieldType>().unwrap(), FieldType::DateTime);
        assert!("blob".parse::<FieldType>().is_err());
    }
}
