//! Record filtering
//!
//! `filterConditions` maps field names to predicates; a record is kept when
//! every predicate holds. Predicate forms:
//!
//! | Condition            | Meaning                               |
//! |----------------------|---------------------------------------|
//! | `"active"`, `3`      | equality (stringified)                |
//! | `"*"`                | field present with any non-null value |
//! | `"US-*"`             | glob match                            |
//! | `"[10,20]"`, `[10,20]` | inclusive numeric range             |
//! | `">5"`, `"<=2024-01-01"`, `"!=x"` | comparison               |
//! | `"null"` / `"notnull"` | null or missing / not null          |

use std::cmp::Ordering;

use async_trait::async_trait;
use flowline_common::types::{ConfigValue, Configuration, ConfigurationExt, DataRecord};
use flowline_common::{FlowlineError, Result};
use regex::Regex;

use super::{as_number, compare_values, plain_string, record_field};
use crate::connectors::{TransformType, Transformer};
use crate::context::WorkflowContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Lt,
    Ge,
    Le,
    Ne,
}

/// A parsed field predicate
#[derive(Debug, Clone)]
pub enum Predicate {
    Equals(String),
    Any,
    Glob(Regex),
    Range(f64, f64),
    Compare(Comparison, serde_json::Value),
    IsNull,
    NotNull,
}

fn parse_range(s: &str) -> Option<(f64, f64)> {
    let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
    let (min, max) = inner.split_once(',')?;
    Some((min.trim().parse().ok()?, max.trim().parse().ok()?))
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
        .map_err(|e| FlowlineError::configuration(format!("invalid pattern '{}': {}", pattern, e)))
}

fn operand(raw: &str) -> serde_json::Value {
    let raw = raw.trim();
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .filter(|v| v.is_number() || v.is_boolean())
        .unwrap_or_else(|| serde_json::Value::String(raw.to_string()))
}

impl Predicate {
    pub fn parse(condition: &ConfigValue) -> Result<Self> {
        match condition {
            ConfigValue::Null => Ok(Predicate::IsNull),
            ConfigValue::List(items) if items.len() == 2 => {
                match (items[0].as_f64(), items[1].as_f64()) {
                    (Some(min), Some(max)) => Ok(Predicate::Range(min, max)),
                    _ => Err(FlowlineError::configuration(
                        "range condition must be two numbers",
                    )),
                }
            },
            ConfigValue::List(_) | ConfigValue::Map(_) => Err(FlowlineError::configuration(
                "unsupported filter condition; use a scalar, [min,max] or an operator string",
            )),
            ConfigValue::String(s) => Self::parse_str(s),
            scalar => Ok(Predicate::Equals(scalar.to_plain_string())),
        }
    }

    fn parse_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "*" => return Ok(Predicate::Any),
            "null" => return Ok(Predicate::IsNull),
            "notnull" | "!null" | "not null" => return Ok(Predicate::NotNull),
            _ => {},
        }
        if let Some((min, max)) = parse_range(trimmed) {
            return Ok(Predicate::Range(min, max));
        }
        for (prefix, cmp) in [
            (">=", Comparison::Ge),
            ("<=", Comparison::Le),
            ("!=", Comparison::Ne),
            (">", Comparison::Gt),
            ("<", Comparison::Lt),
        ] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                return Ok(Predicate::Compare(cmp, operand(rest)));
            }
        }
        if trimmed.contains('*') {
            return Ok(Predicate::Glob(glob_to_regex(trimmed)?));
        }
        Ok(Predicate::Equals(s.to_string()))
    }

    pub fn matches(&self, value: Option<&serde_json::Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match (self, value) {
            (Predicate::IsNull, v) => v.is_none(),
            (_, None) => false,
            (Predicate::NotNull | Predicate::Any, Some(_)) => true,
            (Predicate::Equals(expected), Some(v)) => plain_string(v) == *expected,
            (Predicate::Glob(re), Some(v)) => re.is_match(&plain_string(v)),
            (Predicate::Range(min, max), Some(v)) => {
                as_number(v).is_some_and(|n| n >= *min && n <= *max)
            },
            (Predicate::Compare(cmp, operand), Some(v)) => {
                let ord = compare_values(v, operand);
                match cmp {
                    Comparison::Gt => ord == Ordering::Greater,
                    Comparison::Lt => ord == Ordering::Less,
                    Comparison::Ge => ord != Ordering::Less,
                    Comparison::Le => ord != Ordering::Greater,
                    Comparison::Ne => plain_string(v) != plain_string(operand),
                }
            },
        }
    }
}

/// Parse every condition up front so a bad one fails before any record is touched
pub fn parse_conditions(
    conditions: &std::collections::BTreeMap<String, ConfigValue>,
) -> Result<Vec<(String, Predicate)>> {
    conditions
        .iter()
        .map(|(field, condition)| Ok((field.clone(), Predicate::parse(condition)?)))
        .collect()
}

/// Keep records matching every condition
pub fn filter_records(
    records: Vec<DataRecord>,
    conditions: &std::collections::BTreeMap<String, ConfigValue>,
) -> Result<Vec<DataRecord>> {
    let predicates = parse_conditions(conditions)?;
    Ok(records
        .into_iter()
        .filter(|record| {
            predicates
                .iter()
                .all(|(field, predicate)| predicate.matches(record_field(record, field)))
        })
        .collect())
}

pub struct FilterTransformer;

#[async_trait]
impl Transformer for FilterTransformer {
    fn transform_type(&self) -> TransformType {
        TransformType::Filter
    }

    async fn transform(
        &self,
        _ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>> {
        let conditions = config.get_map("filterConditions").ok_or_else(|| {
            FlowlineError::configuration("filter transformation requires 'filterConditions'")
        })?;
        filter_records(records, conditions)
    }
}
