//! Field mapping: rename and select
//!
//! `fieldMappings` is a target → source mapping; sources may be dotted
//! paths into nested objects. With `includeUnmapped`, fields not used as a
//! mapping source are carried through unchanged.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use flowline_common::types::{ConfigValue, Configuration, ConfigurationExt, DataRecord};
use flowline_common::{FlowlineError, Result};

use super::record_field;
use crate::connectors::{TransformType, Transformer};
use crate::context::WorkflowContext;

/// Apply `mappings` (target → source) to every record
pub fn map_records(
    records: Vec<DataRecord>,
    mappings: &BTreeMap<String, String>,
    include_unmapped: bool,
) -> Vec<DataRecord> {
    let consumed: HashSet<&str> = mappings
        .values()
        .map(|source| source.split('.').next().unwrap_or(source))
        .collect();

    records
        .into_iter()
        .map(|record| {
            let mut fields = BTreeMap::new();
            if include_unmapped {
                fields.extend(
                    record
                        .fields
                        .iter()
                        .filter(|(name, _)| !consumed.contains(name.as_str()))
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
            for (target, source) in mappings {
                if let Some(value) = record_field(&record, source) {
                    fields.insert(target.clone(), value.clone());
                }
            }
            record.with_fields(fields)
        })
        .collect()
}

fn parse_mappings(config: &Configuration) -> Result<BTreeMap<String, String>> {
    let raw = config.get_map("fieldMappings").ok_or_else(|| {
        FlowlineError::configuration("map transformation requires 'fieldMappings'")
    })?;
    raw.iter()
        .map(|(target, source)| match source {
            ConfigValue::String(s) if !s.trim().is_empty() => Ok((target.clone(), s.clone())),
            _ => Err(FlowlineError::configuration(format!(
                "mapping for '{}' must name a source field",
                target
            ))),
        })
        .collect()
}

pub struct MapTransformer;

#[async_trait]
impl Transformer for MapTransformer {
    fn transform_type(&self) -> TransformType {
        TransformType::Map
    }

    async fn transform(
        &self,
        _ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>> {
        let mappings = parse_mappings(config)?;
        let include_unmapped = config.get_bool("includeUnmapped").unwrap_or(false);
        Ok(map_records(records, &mappings, include_unmapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> DataRecord {
        DataRecord::from_json(
            "s",
            json!({"cust_id": 7, "nm": "Ada", "addr": {"city": "Oslo"}, "extra": true}),
        )
    }

    fn mappings() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("customerId".to_string(), "cust_id".to_string()),
            ("name".to_string(), "nm".to_string()),
            ("city".to_string(), "addr.city".to_string()),
            ("phone".to_string(), "tel".to_string()),
        ])
    }

    #[test]
    fn test_select_only_mapped() {
        let out = map_records(vec![record()], &mappings(), false);
        let fields = &out[0].fields;
        assert_eq!(fields.get("customerId"), Some(&json!(7)));
        assert_eq!(fields.get("name"), Some(&json!("Ada")));
        assert_eq!(fields.get("city"), Some(&json!("Oslo")));
        assert!(!fields.contains_key("phone"));
        assert!(!fields.contains_key("extra"));
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_include_unmapped_carries_other_fields() {
        let out = map_records(vec![record()], &mappings(), true);
        let fields = &out[0].fields;
        assert_eq!(fields.get("extra"), Some(&json!(true)));
        assert!(!fields.contains_key("cust_id"));
        assert!(!fields.contains_key("addr"));
    }

    #[test]
    fn test_record_identity_is_kept() {
        let original = record();
        let out = map_records(vec![original.clone()], &mappings(), false);
        assert_eq!(out[0].id, original.id);
        assert_eq!(out[0].source_id, original.source_id);
    }
}
