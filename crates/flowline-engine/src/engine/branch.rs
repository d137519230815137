//! Branch conditions
//!
//! A branch step carries one condition and two target lists:
//!
//! ```json
//! {
//!   "condition": {"field": "region", "operator": "equals", "value": "US"},
//!   "trueBranch": ["load_us"],
//!   "falseBranch": ["load_intl"]
//! }
//! ```
//!
//! The condition field is resolved from execution parameters, then context
//! metadata, then the first input record. Targets that were not selected
//! are skipped along with everything downstream of them.

use std::cmp::Ordering;

use flowline_common::types::{ConfigValue, Configuration, ConfigurationExt, DataRecord};
use flowline_common::{FlowlineError, Result};

use crate::context::WorkflowContext;
use crate::transform::{compare_values, plain_string, record_field};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    In,
    Exists,
}

impl std::str::FromStr for Operator {
    type Err = FlowlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "equals" | "eq" | "==" | "=" => Ok(Operator::Equals),
            "notequals" | "ne" | "!=" => Ok(Operator::NotEquals),
            "greaterthan" | "gt" | ">" => Ok(Operator::GreaterThan),
            "lessthan" | "lt" | "<" => Ok(Operator::LessThan),
            "greaterorequal" | "ge" | ">=" => Ok(Operator::GreaterOrEqual),
            "lessorequal" | "le" | "<=" => Ok(Operator::LessOrEqual),
            "contains" => Ok(Operator::Contains),
            "in" => Ok(Operator::In),
            "exists" => Ok(Operator::Exists),
            other => Err(FlowlineError::configuration(format!(
                "unknown branch operator '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: serde_json::Value,
}

impl Condition {
    /// Evaluate against the resolved field value (`None` when unresolved)
    pub fn evaluate(&self, actual: Option<&serde_json::Value>) -> bool {
        let actual = actual.filter(|v| !v.is_null());
        let Some(actual) = actual else {
            return self.operator == Operator::NotEquals && !self.value.is_null();
        };
        match self.operator {
            Operator::Exists => true,
            Operator::Equals => plain_string(actual) == plain_string(&self.value),
            Operator::NotEquals => plain_string(actual) != plain_string(&self.value),
            Operator::GreaterThan => compare_values(actual, &self.value) == Ordering::Greater,
            Operator::LessThan => compare_values(actual, &self.value) == Ordering::Less,
            Operator::GreaterOrEqual => compare_values(actual, &self.value) != Ordering::Less,
            Operator::LessOrEqual => compare_values(actual, &self.value) != Ordering::Greater,
            Operator::Contains => match actual {
                serde_json::Value::Array(items) => {
                    let needle = plain_string(&self.value);
                    items.iter().any(|item| plain_string(item) == needle)
                },
                other => plain_string(other).contains(&plain_string(&self.value)),
            },
            Operator::In => {
                let needle = plain_string(actual);
                match &self.value {
                    serde_json::Value::Array(items) => {
                        items.iter().any(|item| plain_string(item) == needle)
                    },
                    other => plain_string(other)
                        .split(',')
                        .any(|candidate| candidate.trim() == needle),
                }
            },
        }
    }
}

/// Parsed branch step configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSpec {
    pub condition: Condition,
    pub true_branch: Vec<String>,
    pub false_branch: Vec<String>,
}

impl BranchSpec {
    /// Accepts a nested `condition` mapping or `field`/`operator`/`value`
    /// at the top level of the step configuration.
    pub fn parse(config: &Configuration) -> Result<Self> {
        let condition = config.get_map("condition").unwrap_or(config);
        let field = condition.require_str("field")?.to_string();
        let operator = match condition.get_str("operator") {
            Some(op) => op.parse()?,
            None => Operator::Equals,
        };
        let value = condition
            .value("value")
            .map(ConfigValue::to_json)
            .unwrap_or(serde_json::Value::Null);
        if value.is_null() && !matches!(operator, Operator::Exists | Operator::NotEquals) {
            return Err(FlowlineError::configuration(format!(
                "branch condition on '{}' requires a 'value'",
                field
            )));
        }

        let true_branch = config.get_string_list("trueBranch");
        let false_branch = config.get_string_list("falseBranch");
        if true_branch.is_empty() && false_branch.is_empty() {
            return Err(FlowlineError::configuration(
                "branch step requires 'trueBranch' or 'falseBranch'",
            ));
        }
        if let Some(both) = true_branch.iter().find(|t| false_branch.contains(t)) {
            return Err(FlowlineError::configuration(format!(
                "step '{}' is listed in both branches",
                both
            )));
        }

        Ok(Self {
            condition: Condition {
                field,
                operator,
                value,
            },
            true_branch,
            false_branch,
        })
    }

    pub fn targets(&self) -> impl Iterator<Item = &String> {
        self.true_branch.iter().chain(self.false_branch.iter())
    }

    pub fn select(&self, matched: bool) -> Vec<String> {
        if matched {
            self.true_branch.clone()
        } else {
            self.false_branch.clone()
        }
    }
}

/// Value of `field` for a branch decision
pub async fn resolve_field(
    ctx: &WorkflowContext,
    field: &str,
    records: &[DataRecord],
) -> Option<serde_json::Value> {
    if let Some(value) = ctx.lookup(field).await {
        return Some(value);
    }
    records
        .first()
        .and_then(|record| record_field(record, field))
        .cloned()
}
