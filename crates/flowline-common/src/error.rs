//! Error types for Flowline
//!
//! Every failure is classified into one of the pipeline error kinds. The
//! engine only retries [`ErrorKind::Connection`], [`ErrorKind::Timeout`] and
//! [`ErrorKind::Execution`]; configuration problems fail fast and
//! cancellation unwinds cleanly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StepType;

/// Result type alias for Flowline operations
pub type Result<T> = std::result::Result<T, FlowlineError>;

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid step/connector configuration
    Configuration,
    /// Source unreachable or credentials rejected
    Connection,
    /// Deadline exceeded
    Timeout,
    /// Step logic failure
    Execution,
    /// Cooperative cancellation honored
    Cancelled,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Execution
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Execution => "execution",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for Flowline
#[derive(Error, Debug)]
pub enum FlowlineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Step '{}' failed after {} retries: {}", .0.step_id, .0.retry_count, .0.message)]
    StepFailed(Box<StepFailure>),
}

impl FlowlineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Map this error onto the pipeline taxonomy.
    ///
    /// IO failures count as connection problems (the file or socket could not
    /// be reached); malformed payloads are execution failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowlineError::Configuration(_) => ErrorKind::Configuration,
            FlowlineError::Connection(_) => ErrorKind::Connection,
            FlowlineError::Timeout(_) => ErrorKind::Timeout,
            FlowlineError::Execution(_) => ErrorKind::Execution,
            FlowlineError::Cancelled(_) => ErrorKind::Cancelled,
            FlowlineError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            FlowlineError::Io(_) => ErrorKind::Connection,
            FlowlineError::Serialization(_) => ErrorKind::Execution,
            FlowlineError::StepFailed(failure) => failure.error_kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Full addressing context for a step that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub workflow_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub step_name: String,
    pub step_type: StepType,
    pub error_kind: ErrorKind,
    pub message: String,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "workflow={} execution={} step={} ({}, {}) {} error after {}/{} retries: {}",
            self.workflow_id,
            self.execution_id,
            self.step_id,
            self.step_name,
            self.step_type,
            self.error_kind,
            self.retry_count,
            self.max_retries,
            self.message
        )
    }
}
