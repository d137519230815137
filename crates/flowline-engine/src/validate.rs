//! Record validators
//!
//! - `schema`: required fields and declared field types
//! - `rules`: per-field rules (`notNull`, `regex`, `range`, `oneOf`)
//!
//! Validators only partition records into valid and invalid; the validate
//! step decides whether rejections fail the step (`failOnInvalid`).

use async_trait::async_trait;
use flowline_common::types::{
    ConfigValue, Configuration, ConfigurationExt, DataRecord, FieldDefinition, FieldType,
    SchemaDefinition,
};
use flowline_common::{FlowlineError, Result};
use regex::Regex;

use crate::connectors::schema::looks_like_datetime;
use crate::connectors::{InvalidRecord, ValidationOutcome, Validator, ValidatorType};
use crate::context::WorkflowContext;
use crate::transform::{as_number, plain_string, record_field};

/// Split records by `check`, which returns the violations for one record
fn partition<F>(records: Vec<DataRecord>, mut check: F) -> ValidationOutcome
where
    F: FnMut(&DataRecord) -> Vec<String>,
{
    let mut outcome = ValidationOutcome::default();
    for record in records {
        let errors = check(&record);
        if errors.is_empty() {
            outcome.valid.push(record);
        } else {
            outcome.invalid.push(InvalidRecord { record, errors });
        }
    }
    outcome
}

fn matches_type(field_type: FieldType, value: &serde_json::Value) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Decimal => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::DateTime => value.as_str().is_some_and(looks_like_datetime),
        FieldType::Json => true,
        FieldType::Array => value.is_array(),
        FieldType::Complex => value.is_object(),
    }
}

fn check_field(field: &FieldDefinition, record: &DataRecord, errors: &mut Vec<String>) {
    let value = record.get(&field.name).filter(|v| !v.is_null());
    let Some(value) = value else {
        if field.is_required {
            errors.push(format!("field '{}' is required", field.name));
        }
        return;
    };

    if field.is_array {
        match value.as_array() {
            Some(items) => {
                if let Some(bad) = items
                    .iter()
                    .find(|item| !item.is_null() && !matches_type(field.field_type, item))
                {
                    errors.push(format!(
                        "field '{}' has element {} that is not {}",
                        field.name, bad, field.field_type
                    ));
                }
            },
            None => errors.push(format!("field '{}' must be an array", field.name)),
        }
    } else if !matches_type(field.field_type, value) {
        errors.push(format!(
            "field '{}' must be {} but was {}",
            field.name, field.field_type, value
        ));
    }
}

/// Violations of `schema` by `record`
pub fn schema_violations(schema: &SchemaDefinition, record: &DataRecord) -> Vec<String> {
    let mut errors = Vec::new();
    for field in &schema.fields {
        check_field(field, record, &mut errors);
    }
    errors
}

pub struct SchemaValidator;

#[async_trait]
impl Validator for SchemaValidator {
    fn validator_type(&self) -> ValidatorType {
        ValidatorType::Schema
    }

    async fn validate(
        &self,
        _ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        _config: &Configuration,
        schema: Option<&SchemaDefinition>,
    ) -> Result<ValidationOutcome> {
        let schema = schema.ok_or_else(|| {
            FlowlineError::configuration("schema validation requires a 'schema'")
        })?;
        Ok(partition(records, |record| schema_violations(schema, record)))
    }
}

/// A single field rule
#[derive(Debug, Clone)]
pub enum RuleCheck {
    NotNull,
    Regex(Regex),
    Range { min: Option<f64>, max: Option<f64> },
    OneOf(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub field: String,
    pub check: RuleCheck,
    pub message: Option<String>,
}

impl Rule {
    pub fn parse(spec: &ConfigValue) -> Result<Self> {
        let spec = spec
            .as_map()
            .ok_or_else(|| FlowlineError::configuration("each rule must be a mapping"))?;
        let field = spec.require_str("field")?.to_string();
        let kind = spec.require_str("rule")?;
        let check = match kind.to_lowercase().as_str() {
            "notnull" | "required" => RuleCheck::NotNull,
            "regex" | "pattern" => {
                let pattern = spec.require_str("pattern")?;
                RuleCheck::Regex(Regex::new(pattern).map_err(|e| {
                    FlowlineError::configuration(format!("invalid regex '{}': {}", pattern, e))
                })?)
            },
            "range" => {
                let (min, max) = (spec.get_f64("min"), spec.get_f64("max"));
                if min.is_none() && max.is_none() {
                    return Err(FlowlineError::configuration(format!(
                        "range rule on '{}' needs 'min' or 'max'",
                        field
                    )));
                }
                RuleCheck::Range { min, max }
            },
            "oneof" | "in" => {
                let values: Vec<String> = spec
                    .get_list("values")
                    .map(|items| items.iter().map(ConfigValue::to_plain_string).collect())
                    .unwrap_or_default();
                if values.is_empty() {
                    return Err(FlowlineError::configuration(format!(
                        "oneOf rule on '{}' needs 'values'",
                        field
                    )));
                }
                RuleCheck::OneOf(values)
            },
            other => {
                return Err(FlowlineError::configuration(format!(
                    "unknown validation rule '{}'",
                    other
                )))
            },
        };
        Ok(Self {
            field,
            check,
            message: spec.get_str("message").map(str::to_string),
        })
    }

    /// Error message when `record` violates this rule. Rules other than
    /// `notNull` pass on absent values.
    pub fn violation(&self, record: &DataRecord) -> Option<String> {
        let value = record_field(record, &self.field).filter(|v| !v.is_null());
        let passed = match (&self.check, value) {
            (RuleCheck::NotNull, v) => v.is_some(),
            (_, None) => true,
            (RuleCheck::Regex(re), Some(v)) => re.is_match(&plain_string(v)),
            (RuleCheck::Range { min, max }, Some(v)) => as_number(v).is_some_and(|n| {
                min.map_or(true, |min| n >= min) && max.map_or(true, |max| n <= max)
            }),
            (RuleCheck::OneOf(values), Some(v)) => values.contains(&plain_string(v)),
        };
        if passed {
            return None;
        }
        Some(self.message.clone().unwrap_or_else(|| {
            let what = match &self.check {
                RuleCheck::NotNull => "must not be null".to_string(),
                RuleCheck::Regex(re) => format!("must match {}", re.as_str()),
                RuleCheck::Range { min, max } => format!("must be within [{:?}, {:?}]", min, max),
                RuleCheck::OneOf(values) => format!("must be one of {:?}", values),
            };
            format!("field '{}' {}", self.field, what)
        }))
    }
}

pub fn parse_rules(config: &Configuration) -> Result<Vec<Rule>> {
    let rules = config
        .get_list("rules")
        .ok_or_else(|| FlowlineError::configuration("rules validation requires 'rules'"))?;
    rules.iter().map(Rule::parse).collect()
}

pub struct RulesValidator;

#[async_trait]
impl Validator for RulesValidator {
    fn validator_type(&self) -> ValidatorType {
        ValidatorType::Rules
    }

    async fn validate(
        &self,
        _ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
        _schema: Option<&SchemaDefinition>,
    ) -> Result<ValidationOutcome> {
        let rules = parse_rules(config)?;
        Ok(partition(records, |record| {
            rules.iter().filter_map(|rule| rule.violation(record)).collect()
        }))
    }
}
