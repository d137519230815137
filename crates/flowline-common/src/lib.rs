//! Flowline Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error taxonomy and logging for the Flowline workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`FlowlineError`] and the retry classification in [`ErrorKind`]
//! - **Types**: workflow definitions and executions, records, schemas, checkpoints
//! - **Logging**: `tracing` subscriber setup shared by the engine and CLI
//!
//! # Example
//!
//! ```no_run
//! use flowline_common::types::{StepType, WorkflowDefinition, WorkflowStep};
//!
//! let definition = WorkflowDefinition::new("orders", "Orders pipeline")
//!     .with_step(WorkflowStep::new("extract", StepType::Extract))
//!     .with_step(WorkflowStep::new("load", StepType::Load).depends_on(["extract"]));
//! assert_eq!(definition.steps.len(), 2);
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{ErrorKind, FlowlineError, Result, StepFailure};
