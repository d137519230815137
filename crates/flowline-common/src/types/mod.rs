//! Shared domain types

pub mod checkpoint;
pub mod record;
pub mod value;
pub mod workflow;

pub use checkpoint::{compare_cursors, Checkpoint};
pub use record::{DataRecord, DataSourceDefinition, FieldDefinition, FieldType, SchemaDefinition};
pub use value::{ConfigValue, Configuration, ConfigurationExt};
pub use workflow::{
    ExecutionStatus, StepOutput, StepResult, StepStatus, StepType, WorkflowDefinition,
    WorkflowExecution, WorkflowStep,
};
