//! Workflow repository
//!
//! Persists workflow definitions, executions and data-source definitions
//! for the engine. Only the in-memory implementation ships here; durable
//! backends plug in behind [`WorkflowRepository`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use flowline_common::types::{
    DataSourceDefinition, ExecutionStatus, StepStatus, StepType, WorkflowDefinition,
    WorkflowExecution,
};
use flowline_common::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::monitor::MetricsRepository;

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()>;

    async fn get_definition(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>>;

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Insert or replace the execution snapshot
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>>;

    /// Executions of `workflow_id`, most recently started first
    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>>;

    async fn save_data_source(&self, source: &DataSourceDefinition) -> Result<()>;

    async fn get_data_source(&self, source_id: &str) -> Result<Option<DataSourceDefinition>>;
}

/// Aggregate counters for one workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetrics {
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub executions_cancelled: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub records_processed: u64,
    pub total_duration_ms: u64,
    pub records_by_step_type: HashMap<StepType, u64>,
}

impl WorkflowMetrics {
    pub fn executions_finished(&self) -> u64 {
        self.executions_completed + self.executions_failed + self.executions_cancelled
    }

    /// Completed share of finished executions, 0.0 when none finished
    pub fn success_rate(&self) -> f64 {
        match self.executions_finished() {
            0 => 0.0,
            n => self.executions_completed as f64 / n as f64,
        }
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    executions: RwLock<HashMap<String, WorkflowExecution>>,
    sources: RwLock<HashMap<String, DataSourceDefinition>>,
    metrics: RwLock<HashMap<String, WorkflowMetrics>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn metrics(&self, workflow_id: &str) -> WorkflowMetrics {
        self.metrics
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.definitions.read().await.get(workflow_id).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut definitions: Vec<_> = self.definitions.read().await.values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.read().await.get(execution_id).cloned())
    }

    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>> {
        let mut executions: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(executions)
    }

    async fn save_data_source(&self, source: &DataSourceDefinition) -> Result<()> {
        self.sources
            .write()
            .await
            .insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn get_data_source(&self, source_id: &str) -> Result<Option<DataSourceDefinition>> {
        Ok(self.sources.read().await.get(source_id).cloned())
    }
}

#[async_trait]
impl MetricsRepository for InMemoryWorkflowRepository {
    async fn record_execution(
        &self,
        workflow_id: &str,
        status: ExecutionStatus,
        duration: Duration,
    ) -> Result<()> {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(workflow_id.to_string()).or_default();
        match status {
            ExecutionStatus::Completed => entry.executions_completed += 1,
            ExecutionStatus::Failed => entry.executions_failed += 1,
            ExecutionStatus::Cancelled => entry.executions_cancelled += 1,
            _ => {},
        }
        entry.total_duration_ms += duration.as_millis() as u64;
        Ok(())
    }

    async fn record_step(
        &self,
        workflow_id: &str,
        step_type: StepType,
        status: StepStatus,
        records_processed: u64,
    ) -> Result<()> {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(workflow_id.to_string()).or_default();
        match status {
            StepStatus::Completed => {
                entry.steps_completed += 1;
                entry.records_processed += records_processed;
                *entry.records_by_step_type.entry(step_type).or_default() += records_processed;
            },
            StepStatus::Failed => entry.steps_failed += 1,
            StepStatus::Skipped => entry.steps_skipped += 1,
            _ => {},
        }
        Ok(())
    }
}
