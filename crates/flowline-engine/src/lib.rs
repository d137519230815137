//! Flowline Engine Library
//!
//! Runs data-pipeline workflows: a DAG of extract, transform, validate,
//! enrich, load, branch and custom steps over pluggable connectors.
//!
//! # Components
//!
//! - **Engine**: dependency resolution, bounded parallel scheduling, retry
//!   with backoff, pause/resume/cancel ([`engine`])
//! - **Connectors**: REST, database, filesystem and streaming extractors and
//!   loaders behind capability traits ([`connectors`])
//! - **Transforms**: filter, map, flatten and aggregate ([`transform`])
//! - **Checkpoints**: monotonic per-source cursors in file, database or cache
//!   stores ([`checkpoint`])
//! - **Lineage** and **monitoring**: best-effort data lineage and a bounded
//!   execution timeline ([`lineage`], [`monitor`])
//!
//! # Example
//!
//! ```no_run
//! use flowline_common::types::{Configuration, StepType, WorkflowDefinition, WorkflowStep};
//! use flowline_engine::{EngineConfig, WorkflowEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = WorkflowEngine::builder(EngineConfig::default()).build().await?;
//!     let definition = WorkflowDefinition::new("orders", "Orders")
//!         .with_step(
//!             WorkflowStep::new("extract", StepType::Extract)
//!                 .with_config("connectorType", "filesystem")
//!                 .with_config("path", "./data/orders.json"),
//!         )
//!         .with_step(
//!             WorkflowStep::new("load", StepType::Load)
//!                 .with_config("connectorType", "filesystem")
//!                 .with_config("path", "./out/orders.jsonl")
//!                 .depends_on(["extract"]),
//!         );
//!     engine.register_workflow(&definition).await?;
//!     let execution = engine.execute("orders", Configuration::new()).await?;
//!     println!("{}", execution.status);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod connectors;
pub mod context;
pub mod definition;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod lineage;
pub mod monitor;
pub mod repository;
pub mod sql;
pub mod transform;
pub mod validate;

pub use config::EngineConfig;
pub use context::WorkflowContext;
pub use definition::{load_definition, parse_definition, parse_parameters, DefinitionFormat};
pub use engine::{RunningExecution, WorkflowEngine, WorkflowEngineBuilder};
