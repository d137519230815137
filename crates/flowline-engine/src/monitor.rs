//! Workflow monitor
//!
//! Keeps a bounded, append-only timeline of execution events in memory and
//! forwards aggregate counters to a [`MetricsRepository`]. Nothing here
//! returns an error to the engine: a metrics write that fails is logged
//! and dropped.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_common::types::{ExecutionStatus, StepStatus, StepType, WorkflowExecution};
use flowline_common::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DEFAULT_TIMELINE_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimelineEventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    ExecutionPaused,
    ExecutionResumed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetried,
    StepSkipped,
}

impl TimelineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineEventType::ExecutionStarted => "ExecutionStarted",
            TimelineEventType::ExecutionCompleted => "ExecutionCompleted",
            TimelineEventType::ExecutionFailed => "ExecutionFailed",
            TimelineEventType::ExecutionCancelled => "ExecutionCancelled",
            TimelineEventType::ExecutionPaused => "ExecutionPaused",
            TimelineEventType::ExecutionResumed => "ExecutionResumed",
            TimelineEventType::StepStarted => "StepStarted",
            TimelineEventType::StepCompleted => "StepCompleted",
            TimelineEventType::StepFailed => "StepFailed",
            TimelineEventType::StepRetried => "StepRetried",
            TimelineEventType::StepSkipped => "StepSkipped",
        }
    }

    /// Event closing an execution that ended in `status`
    pub fn for_terminal(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Completed => Some(TimelineEventType::ExecutionCompleted),
            ExecutionStatus::Failed => Some(TimelineEventType::ExecutionFailed),
            ExecutionStatus::Cancelled => Some(TimelineEventType::ExecutionCancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimelineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: Option<String>,
    pub event_type: TimelineEventType,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    /// Attempt number (0-based) for step events
    pub attempt: Option<u32>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl TimelineEvent {
    pub fn execution(
        workflow_id: &str,
        execution_id: &str,
        event_type: TimelineEventType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            step_id: None,
            event_type,
            timestamp: Utc::now(),
            message: None,
            attempt: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn step(
        workflow_id: &str,
        execution_id: &str,
        step_id: &str,
        event_type: TimelineEventType,
    ) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            ..Self::execution(workflow_id, execution_id, event_type)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Sink for aggregate counters
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn record_execution(
        &self,
        workflow_id: &str,
        status: ExecutionStatus,
        duration: Duration,
    ) -> Result<()>;

    async fn record_step(
        &self,
        workflow_id: &str,
        step_type: StepType,
        status: StepStatus,
        records_processed: u64,
    ) -> Result<()>;
}

pub struct WorkflowMonitor {
    timeline: Mutex<VecDeque<TimelineEvent>>,
    capacity: usize,
    metrics: Option<Arc<dyn MetricsRepository>>,
}

impl Default for WorkflowMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMELINE_CAPACITY)
    }
}

impl WorkflowMonitor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            timeline: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_TIMELINE_CAPACITY))),
            capacity,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRepository>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Append `event`, evicting the oldest entry once the timeline is full
    pub async fn record(&self, event: TimelineEvent) {
        debug!(
            workflow_id = %event.workflow_id,
            execution_id = %event.execution_id,
            step_id = event.step_id.as_deref().unwrap_or("-"),
            event = %event.event_type,
            "Timeline event"
        );
        let mut timeline = self.timeline.lock().await;
        if timeline.len() >= self.capacity {
            timeline.pop_front();
        }
        timeline.push_back(event);
    }

    /// Retained events of one execution, oldest first
    pub async fn events_for(&self, execution_id: &str) -> Vec<TimelineEvent> {
        self.timeline
            .lock()
            .await
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub async fn count(&self, execution_id: &str, event_type: TimelineEventType) -> usize {
        self.timeline
            .lock()
            .await
            .iter()
            .filter(|e| e.execution_id == execution_id && e.event_type == event_type)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.timeline.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.timeline.lock().await.is_empty()
    }

    pub async fn step_finished(
        &self,
        workflow_id: &str,
        step_type: StepType,
        status: StepStatus,
        records_processed: u64,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        if let Err(e) = metrics
            .record_step(workflow_id, step_type, status, records_processed)
            .await
        {
            warn!(workflow_id, step_type = %step_type, error = %e, "Failed to record step metrics");
        }
    }

    pub async fn execution_finished(&self, execution: &WorkflowExecution) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let duration = match (execution.started_at, execution.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        if let Err(e) = metrics
            .record_execution(&execution.workflow_id, execution.status, duration)
            .await
        {
            warn!(
                workflow_id = %execution.workflow_id,
                execution_id = %execution.id,
                error = %e,
                "Failed to record execution metrics"
            );
        }
    }
}
