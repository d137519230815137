//! Flatten nested objects into `parent_child` fields

use async_trait::async_trait;
use flowline_common::types::{Configuration, ConfigurationExt, DataRecord};
use flowline_common::{FlowlineError, Result};

use crate::connectors::{TransformType, Transformer};
use crate::context::WorkflowContext;

/// Replace each configured object field with one `parent_key` field per
/// nested key. Non-object values are left alone.
pub fn flatten_records(records: Vec<DataRecord>, fields: &[String]) -> Vec<DataRecord> {
    records
        .into_iter()
        .map(|record| {
            let mut flat = record.fields.clone();
            for parent in fields {
                if let Some(serde_json::Value::Object(children)) = flat.get(parent).cloned() {
                    flat.remove(parent);
                    for (child, value) in children {
                        flat.insert(format!("{}_{}", parent, child), value);
                    }
                }
            }
            record.with_fields(flat)
        })
        .collect()
}

pub struct FlattenTransformer;

#[async_trait]
impl Transformer for FlattenTransformer {
    fn transform_type(&self) -> TransformType {
        TransformType::Flatten
    }

    async fn transform(
        &self,
        _ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>> {
        let fields = config.get_string_list("flattenFields");
        if fields.is_empty() {
            return Err(FlowlineError::configuration(
                "flatten transformation requires 'flattenFields'",
            ));
        }
        Ok(flatten_records(records, &fields))
    }
}
