//! Group-by aggregation
//!
//! ```json
//! {
//!   "transformationType": "aggregate",
//!   "groupBy": ["region"],
//!   "aggregations": {
//!     "total": {"function": "sum", "field": "amount"},
//!     "orders": "count:id"
//!   }
//! }
//! ```
//!
//! Groups are keyed by the stringified values of the `groupBy` fields and
//! emitted in first-seen order.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use flowline_common::types::{ConfigValue, Configuration, ConfigurationExt, DataRecord};
use flowline_common::{FlowlineError, Result};

use super::{as_number, compare_values, number, plain_string, record_field};
use crate::connectors::{TransformType, Transformer};
use crate::context::WorkflowContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl std::str::FromStr for AggregateFunction {
    type Err = FlowlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sum" => Ok(AggregateFunction::Sum),
            "avg" | "average" | "mean" => Ok(AggregateFunction::Avg),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "count" => Ok(AggregateFunction::Count),
            "first" => Ok(AggregateFunction::First),
            "last" => Ok(AggregateFunction::Last),
            other => Err(FlowlineError::configuration(format!(
                "unknown aggregate function '{}'",
                other
            ))),
        }
    }
}

/// One output column of an aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub output: String,
    pub function: AggregateFunction,
    /// Source field; `None` (or `*`) counts records
    pub field: Option<String>,
}

impl Aggregation {
    fn parse(output: &str, spec: &ConfigValue) -> Result<Self> {
        let (function, field) = match spec {
            ConfigValue::String(s) => match s.split_once(':') {
                Some((f, field)) => (f.to_string(), Some(field.trim().to_string())),
                None => (s.clone(), None),
            },
            ConfigValue::Map(map) => (
                map.require_str("function")?.to_string(),
                map.get_str("field").map(str::to_string),
            ),
            _ => {
                return Err(FlowlineError::configuration(format!(
                    "aggregation '{}' must be \"function:field\" or {{function, field}}",
                    output
                )))
            },
        };
        let function: AggregateFunction = function.parse()?;
        let field = field.filter(|f| !f.is_empty() && f != "*");
        if field.is_none() && function != AggregateFunction::Count {
            return Err(FlowlineError::configuration(format!(
                "aggregation '{}' needs a source field",
                output
            )));
        }
        Ok(Self {
            output: output.to_string(),
            function,
            field,
        })
    }

    fn apply(&self, group: &[&DataRecord]) -> serde_json::Value {
        let Some(field) = &self.field else {
            return serde_json::Value::from(group.len() as u64);
        };
        let values: Vec<&serde_json::Value> = group
            .iter()
            .filter_map(|r| record_field(r, field))
            .filter(|v| !v.is_null())
            .collect();

        match self.function {
            AggregateFunction::Count => serde_json::Value::from(values.len() as u64),
            AggregateFunction::Sum => sum(&values),
            AggregateFunction::Avg => {
                let nums: Vec<f64> = values.iter().filter_map(|v| as_number(v)).collect();
                if nums.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Number::from_f64(nums.iter().sum::<f64>() / nums.len() as f64)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            },
            AggregateFunction::Min => values
                .iter()
                .min_by(|a, b| compare_values(a, b))
                .map(|v| (*v).clone())
                .unwrap_or(serde_json::Value::Null),
            AggregateFunction::Max => values
                .iter()
                .max_by(|a, b| compare_values(a, b))
                .map(|v| (*v).clone())
                .unwrap_or(serde_json::Value::Null),
            AggregateFunction::First => values
                .first()
                .map(|v| (*v).clone())
                .unwrap_or(serde_json::Value::Null),
            AggregateFunction::Last => values
                .last()
                .map(|v| (*v).clone())
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Integer sums stay exact; anything fractional falls back to `f64`
fn sum(values: &[&serde_json::Value]) -> serde_json::Value {
    let ints: Option<Vec<i64>> = values.iter().map(|v| v.as_i64()).collect();
    if let Some(total) = ints.and_then(|ints| ints.into_iter().try_fold(0i64, i64::checked_add)) {
        return serde_json::Value::from(total);
    }
    number(values.iter().filter_map(|v| as_number(v)).sum())
}

/// Group `records` by `group_by` and apply `aggregations` per group
pub fn aggregate_records(
    records: &[DataRecord],
    group_by: &[String],
    aggregations: &[Aggregation],
) -> Vec<DataRecord> {
    let mut order: Vec<Vec<String>> = Vec::new();
    let mut groups: HashMap<Vec<String>, Vec<&DataRecord>> = HashMap::new();

    for record in records {
        let key: Vec<String> = group_by
            .iter()
            .map(|f| record_field(record, f).map(plain_string).unwrap_or_default())
            .collect();
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(record);
    }

    let source_id = records
        .first()
        .map(|r| r.source_id.clone())
        .unwrap_or_default();

    order
        .into_iter()
        .filter_map(|key| {
            let members = groups.remove(&key)?;
            let mut fields = BTreeMap::new();
            for field in group_by {
                let value = members
                    .first()
                    .and_then(|r| record_field(r, field))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                fields.insert(field.clone(), value);
            }
            for aggregation in aggregations {
                fields.insert(aggregation.output.clone(), aggregation.apply(&members));
            }
            Some(DataRecord::new(source_id.clone(), fields))
        })
        .collect()
}

fn parse_aggregations(config: &Configuration) -> Result<Vec<Aggregation>> {
    let raw = config.get_map("aggregations").ok_or_else(|| {
        FlowlineError::configuration("aggregate transformation requires 'aggregations'")
    })?;
    raw.iter()
        .map(|(output, spec)| Aggregation::parse(output, spec))
        .collect()
}

pub struct AggregateTransformer;

#[async_trait]
impl Transformer for AggregateTransformer {
    fn transform_type(&self) -> TransformType {
        TransformType::Aggregate
    }

    async fn transform(
        &self,
        _ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>> {
        let group_by = config.get_string_list("groupBy");
        let aggregations = parse_aggregations(config)?;
        Ok(aggregate_records(&records, &group_by, &aggregations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sales() -> Vec<DataRecord> {
        vec![
            json!({"region": "US", "amount": 10, "day": "2024-01-02"}),
            json!({"region": "EU", "amount": 5, "day": "2024-01-01"}),
            json!({"region": "US", "amount": 7, "day": "2024-01-01"}),
            json!({"region": "US", "amount": 2.5, "day": "2024-01-03"}),
            json!({"region": "EU", "amount": null, "day": "2024-01-04"}),
        ]
        .into_iter()
        .map(|v| DataRecord::from_json("sales", v))
        .collect()
    }

    fn agg(output: &str, spec: serde_json::Value) -> Aggregation {
        Aggregation::parse(output, &ConfigValue::from(spec)).unwrap()
    }

    #[test]
    fn test_group_order_and_functions() {
        let out = aggregate_records(
            &sales(),
            &["region".to_string()],
            &[
                agg("total", json!("sum:amount")),
                agg("avg", json!({"function": "avg", "field": "amount"})),
                agg("rows", json!("count")),
                agg("amounts", json!("count:amount")),
                agg("first_day", json!("first:day")),
                agg("last_day", json!("last:day")),
                agg("min_amount", json!("min:amount")),
                agg("max_day", json!("max:day")),
            ],
        );

        assert_eq!(out.len(), 2);
        let us = &out[0].fields;
        assert_eq!(us.get("region"), Some(&json!("US")));
        assert_eq!(us.get("total"), Some(&json!(19.5)));
        assert_eq!(us.get("rows"), Some(&json!(3)));
        assert_eq!(us.get("first_day"), Some(&json!("2024-01-02")));
        assert_eq!(us.get("last_day"), Some(&json!("2024-01-03")));
        assert_eq!(us.get("min_amount"), Some(&json!(2.5)));
        assert_eq!(us.get("max_day"), Some(&json!("2024-01-03")));
        assert_eq!(us.get("avg"), Some(&json!(6.5)));

        let eu = &out[1].fields;
        assert_eq!(eu.get("total"), Some(&json!(5)));
        assert_eq!(eu.get("rows"), Some(&json!(2)));
        assert_eq!(eu.get("amounts"), Some(&json!(1)));
    }

    #[test]
    fn test_grouping_compares_stringified_values() {
        let records: Vec<DataRecord> = vec![json!({"k": 1, "v": 1}), json!({"k": "1", "v": 2})]
            .into_iter()
            .map(|v| DataRecord::from_json("s", v))
            .collect();
        let out = aggregate_records(&records, &["k".to_string()], &[agg("v", json!("sum:v"))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].fields.get("v"), Some(&json!(3)));
    }

    #[test]
    fn test_unknown_function_is_configuration_error() {
        let err = Aggregation::parse("x", &ConfigValue::from("median:amount")).unwrap_err();
        assert_eq!(err.kind(), flowline_common::ErrorKind::Configuration);
    }

    #[test]
    fn test_sum_requires_field() {
        assert!(Aggregation::parse("x", &ConfigValue::from("sum")).is_err());
    }
}
