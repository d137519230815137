//! Workflow definition files
//!
//! Definitions are JSON or YAML documents shaped like
//! [`WorkflowDefinition`]; the format follows the file extension.

use std::path::Path;

use flowline_common::types::{ConfigValue, Configuration, WorkflowDefinition};
use flowline_common::{FlowlineError, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(Self::Json),
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            _ => Err(FlowlineError::configuration(format!(
                "cannot tell the format of '{}': expected .json, .yaml or .yml",
                path.display()
            ))),
        }
    }
}

pub fn parse_definition(text: &str, format: DefinitionFormat) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = match format {
        DefinitionFormat::Json => serde_json::from_str(text).map_err(|e| {
            FlowlineError::configuration(format!("invalid workflow definition: {}", e))
        })?,
        DefinitionFormat::Yaml => serde_yaml::from_str(text).map_err(|e| {
            FlowlineError::configuration(format!("invalid workflow definition: {}", e))
        })?,
    };
    if definition.id.trim().is_empty() {
        return Err(FlowlineError::configuration("workflow definition requires an 'id'"));
    }
    Ok(definition)
}

pub async fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let format = DefinitionFormat::from_path(path)?;
    let text = tokio::fs::read_to_string(path).await?;
    let definition = parse_definition(&text, format)?;
    debug!(
        path = %path.display(),
        workflow_id = %definition.id,
        steps = definition.steps.len(),
        "Loaded workflow definition"
    );
    Ok(definition)
}

/// Parse a `key=value` parameter. Values that read as JSON keep their
/// type (`limit=10`, `dry=true`); anything else is a string.
pub fn parse_parameter(raw: &str) -> Result<(String, ConfigValue)> {
    let (key, value) = raw.split_once('=').ok_or_else(|| {
        FlowlineError::configuration(format!("parameter '{}' is not key=value", raw))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(FlowlineError::configuration(format!(
            "parameter '{}' has an empty key",
            raw
        )));
    }
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(json) => ConfigValue::from(json),
        Err(_) => ConfigValue::from(value),
    };
    Ok((key.to_string(), value))
}

pub fn parse_parameters<'a>(raw: impl IntoIterator<Item = &'a str>) -> Result<Configuration> {
    raw.into_iter().map(parse_parameter).collect()
}
