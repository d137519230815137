//! Workflow definitions, executions and step results

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::DataRecord;
use super::value::Configuration;
use crate::error::{FlowlineError, Result, StepFailure};

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepType {
    Extract,
    Transform,
    Validate,
    Enrich,
    Load,
    Branch,
    Custom,
}

impl StepType {
    pub const ALL: [StepType; 7] = [
        StepType::Extract,
        StepType::Transform,
        StepType::Validate,
        StepType::Enrich,
        StepType::Load,
        StepType::Branch,
        StepType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Extract => "Extract",
            StepType::Transform => "Transform",
            StepType::Validate => "Validate",
            StepType::Enrich => "Enrich",
            StepType::Load => "Load",
            StepType::Branch => "Branch",
            StepType::Custom => "Custom",
        }
    }
}

impl std::str::FromStr for StepType {
    type Err = FlowlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FlowlineError::configuration(format!("unknown step type '{}'", s)))
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub configuration: Configuration,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            configuration: Configuration::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_config(
        mut self,
        key: impl Into<String>,
        value: impl Into<super::value::ConfigValue>,
    ) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A named graph of steps plus global configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub configuration: Configuration,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            configuration: Configuration::new(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Completed, Failed and Cancelled are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            },
            (Paused, Running) | (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Paused => "Paused",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Per-step state within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// What a step produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub records: Vec<DataRecord>,
    pub records_processed: u64,
    pub records_loaded: u64,
    pub records_rejected: u64,
    pub is_success: bool,
    /// Successor step ids chosen by a branch step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_branches: Option<Vec<String>>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl StepOutput {
    /// Successful output carrying `records`
    pub fn with_records(records: Vec<DataRecord>) -> Self {
        Self {
            records_processed: records.len() as u64,
            records,
            is_success: true,
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Outcome of one step within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub output: Option<StepOutput>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepResult {
    pub fn pending(step: &WorkflowStep) -> Self {
        Self {
            step_id: step.id.clone(),
            step_type: step.step_type,
            status: StepStatus::Pending,
            output: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// A single run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub parameters: Configuration,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when a step exhausted its retries
    pub failure: Option<StepFailure>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(definition: &WorkflowDefinition, parameters: Configuration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Pending,
            step_results: definition
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepResult::pending(s)))
                .collect(),
            parameters,
            started_at: None,
            completed_at: None,
            failure: None,
            error: None,
        }
    }

    /// Move to `next`, stamping start/end times. Illegal transitions are
    /// rejected and leave the execution untouched.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FlowlineError::execution(format!(
                "illegal execution transition {} -> {}",
                self.status, next
            )));
        }
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_results.get(step_id).map(|r| r.status)
    }

    pub fn output(&self, step_id: &str) -> Option<&StepOutput> {
        self.step_results.get(step_id).and_then(|r| r.output.as_ref())
    }
}
