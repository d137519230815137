//! Connector framework
//!
//! Five capability sets, each keyed by a tag enum and resolved through the
//! [`ConnectorRegistry`]:
//!
//! | Capability      | Tag               | Implementations                       |
//! |-----------------|-------------------|---------------------------------------|
//! | [`Extractor`]   | [`ConnectorType`] | REST, database, filesystem, streaming |
//! | [`Loader`]      | [`ConnectorType`] | REST, database, filesystem, streaming |
//! | [`Transformer`] | [`TransformType`] | filter, map, flatten, aggregate       |
//! | [`Validator`]   | [`ValidatorType`] | schema, rules                         |
//! | [`Enricher`]    | [`EnricherType`]  | lookup, computed, rest                |
//!
//! Source connectors additionally expose the shared source contract:
//! connection validation, bounded fetches, lazy streams, schema inference
//! and checkpoint access.

pub mod database;
pub mod filesystem;
pub mod registry;
pub mod rest;
pub mod schema;
pub mod streaming;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use flowline_common::types::{
    Checkpoint, ConfigValue, Configuration, ConfigurationExt, DataRecord, DataSourceDefinition,
    SchemaDefinition,
};
use flowline_common::{FlowlineError, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use registry::ConnectorRegistry;

use crate::checkpoint::CheckpointManager;
use crate::context::WorkflowContext;

/// Records sampled for schema inference
pub const SCHEMA_SAMPLE_SIZE: usize = 10;

/// Deadline for collecting the schema sample
pub const SCHEMA_SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

macro_rules! tag_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $what:literal {
            $($variant:ident => $canonical:literal $(| $alias:literal)*),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $canonical),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = FlowlineError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($canonical $(| $alias)* => Ok($name::$variant),)+
                    other => Err(FlowlineError::configuration(format!(
                        concat!("unknown ", $what, " '{}'"),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

tag_enum! {
    /// Source/sink connector variant
    ConnectorType, "connector type" {
        Rest => "rest" | "http" | "api",
        Database => "database" | "db" | "sql",
        FileSystem => "filesystem" | "file" | "fs",
        Streaming => "streaming" | "stream" | "kafka" | "eventhub",
    }
}

tag_enum! {
    /// Transform algebra operation
    TransformType, "transformation type" {
        Filter => "filter",
        Map => "map" | "mapping",
        Flatten => "flatten",
        Aggregate => "aggregate" | "aggregation",
    }
}

tag_enum! {
    /// Record validator variant
    ValidatorType, "validation type" {
        Schema => "schema",
        Rules => "rules" | "rule",
    }
}

tag_enum! {
    /// Record enricher variant
    EnricherType, "enrichment type" {
        Lookup => "lookup",
        Computed => "computed" | "compute",
        Rest => "rest" | "http" | "api",
    }
}

/// Parse a required tag from step configuration
pub fn required_tag<T>(config: &Configuration, key: &str) -> Result<T>
where
    T: std::str::FromStr<Err = FlowlineError>,
{
    config.require_str(key)?.parse()
}

/// Options for a bounded fetch
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    /// Stop after this many records
    pub max_records: Option<usize>,
    /// Stop collecting after this long and return what was gathered
    pub timeout: Option<Duration>,
    /// Resume after this cursor
    pub since: Option<String>,
    /// Observed at I/O boundaries
    pub cancel: Option<CancellationToken>,
}

impl FetchParams {
    /// Read `maxRecords` and `fetchTimeoutMs` from step configuration
    pub fn from_config(config: &Configuration, since: Option<String>) -> Self {
        Self {
            max_records: config.get_u64("maxRecords").map(|n| n as usize),
            timeout: config.get_u64("fetchTimeoutMs").map(Duration::from_millis),
            since,
            cancel: None,
        }
    }

    pub fn sample() -> Self {
        Self {
            max_records: Some(SCHEMA_SAMPLE_SIZE),
            timeout: Some(SCHEMA_SAMPLE_TIMEOUT),
            ..Default::default()
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Truncate `records` to `max_records`
    pub fn limit<T>(&self, records: &mut Vec<T>) {
        if let Some(max) = self.max_records {
            records.truncate(max);
        }
    }
}

/// Result of a bounded fetch
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub records: Vec<DataRecord>,
    /// Cursor to resume after this batch
    pub cursor: Option<String>,
}

/// Result of a sink write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub loaded: u64,
    pub failed: u64,
    pub errors: Vec<String>,
}

/// Source side of a connector
#[async_trait]
pub trait Extractor: Send + Sync {
    fn connector_type(&self) -> ConnectorType;

    /// Check the source is reachable; `Ok(false)` when reachable but unusable
    async fn validate_connection(&self, source: &DataSourceDefinition) -> Result<bool>;

    /// Bounded batch honoring `params`
    async fn fetch_data(&self, source: &DataSourceDefinition, params: &FetchParams)
        -> Result<Batch>;

    /// Lazy record stream; ends when the source is exhausted or `cancel`
    /// fires. Not restartable.
    fn stream_data<'a>(
        &'a self,
        source: &'a DataSourceDefinition,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<DataRecord>> {
        let params = FetchParams::default().with_cancel(cancel.clone());
        stream::once(async move { self.fetch_data(source, &params).await })
            .flat_map(|batch| match batch {
                Ok(batch) => stream::iter(batch.records.into_iter().map(Ok)).boxed(),
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .take_until(cancel.cancelled_owned())
            .boxed()
    }

    /// Declared schema, or one inferred from a small sample
    async fn infer_schema(&self, source: &DataSourceDefinition) -> Result<SchemaDefinition> {
        if let Some(schema) = &source.schema {
            return Ok(schema.clone());
        }
        let sample = tokio::time::timeout(
            SCHEMA_SAMPLE_TIMEOUT,
            self.fetch_data(source, &FetchParams::sample()),
        )
        .await
        .map_err(|_| {
            FlowlineError::timeout(format!("schema sample from '{}' timed out", source.id))
        })??;
        let sampled = sample.records.len().min(SCHEMA_SAMPLE_SIZE);
        Ok(schema::infer_schema(&source.id, &sample.records[..sampled]))
    }

    async fn get_latest_checkpoint(
        &self,
        source: &DataSourceDefinition,
        checkpoints: &CheckpointManager,
    ) -> Result<Option<Checkpoint>> {
        checkpoints.latest(&source.id).await
    }

    async fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        checkpoints: &CheckpointManager,
    ) -> Result<bool> {
        checkpoints.save(checkpoint).await
    }

    /// Capability operation: fetch per step configuration, resuming from the
    /// source's checkpoint when `incremental` (default true).
    async fn extract(
        &self,
        ctx: &WorkflowContext,
        config: &Configuration,
        source: &DataSourceDefinition,
        checkpoints: &CheckpointManager,
    ) -> Result<Batch> {
        let incremental = config.get_bool("incremental").unwrap_or(true);
        let since = if incremental {
            self.get_latest_checkpoint(source, checkpoints)
                .await?
                .map(|c| c.checkpoint_value)
        } else {
            None
        };
        debug!(source_id = %source.id, since = ?since, "Extracting");

        let params =
            FetchParams::from_config(config, since).with_cancel(ctx.cancellation().clone());
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(FlowlineError::cancelled(format!(
                "extraction from '{}' cancelled",
                source.id
            ))),
            batch = self.fetch_data(source, &params) => batch,
        }
    }
}

/// Sink side of a connector
#[async_trait]
pub trait Loader: Send + Sync {
    fn connector_type(&self) -> ConnectorType;

    async fn load(
        &self,
        ctx: &WorkflowContext,
        records: &[DataRecord],
        config: &Configuration,
        target: &DataSourceDefinition,
    ) -> Result<LoadResult>;
}

/// A transform algebra operation
#[async_trait]
pub trait Transformer: Send + Sync {
    fn transform_type(&self) -> TransformType;

    async fn transform(
        &self,
        ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>>;
}

/// A record rejected by a validator
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRecord {
    pub record: DataRecord,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutcome {
    pub valid: Vec<DataRecord>,
    pub invalid: Vec<InvalidRecord>,
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn validator_type(&self) -> ValidatorType;

    async fn validate(
        &self,
        ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
        schema: Option<&SchemaDefinition>,
    ) -> Result<ValidationOutcome>;
}

#[async_trait]
pub trait Enricher: Send + Sync {
    fn enricher_type(&self) -> EnricherType;

    async fn enrich(
        &self,
        ctx: &WorkflowContext,
        records: Vec<DataRecord>,
        config: &Configuration,
    ) -> Result<Vec<DataRecord>>;
}

/// Build the source/target definition for a step.
///
/// Starts from a registered definition when one is known and overlays the
/// step's scalar configuration entries as connection properties, so a step
/// can be fully self-describing (`{"url": ..., "authType": ...}`).
pub fn source_from_config(
    step_id: &str,
    connector_type: ConnectorType,
    config: &Configuration,
    registered: Option<DataSourceDefinition>,
) -> DataSourceDefinition {
    let mut source = registered.unwrap_or_else(|| {
        let id = config.get_str("sourceId").unwrap_or(step_id).to_string();
        DataSourceDefinition::new(id, connector_type.as_str())
    });

    for (key, value) in config {
        match value {
            ConfigValue::List(_) | ConfigValue::Map(_) | ConfigValue::Null => {},
            scalar => {
                source
                    .connection_properties
                    .insert(key.clone(), scalar.to_plain_string());
            },
        }
    }

    if source.schema.is_none() {
        if let Some(schema) = config.value("schema") {
            source.schema = serde_json::from_value(schema.to_json()).ok();
        }
    }
    source
}

/// Required connection property
pub fn require_property<'a>(source: &'a DataSourceDefinition, key: &str) -> Result<&'a str> {
    source
        .property(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            FlowlineError::configuration(format!(
                "data source '{}' is missing connection property '{}'",
                source.id, key
            ))
        })
}

/// Follow a dotted path (`data.items`) into a JSON value
pub fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Turn a JSON payload into records: arrays yield one record per element
pub fn records_from_json(source_id: &str, payload: serde_json::Value) -> Vec<DataRecord> {
    match payload {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| DataRecord::from_json(source_id, item))
            .collect(),
        serde_json::Value::Null => Vec::new(),
        other => vec![DataRecord::from_json(source_id, other)],
    }
}

/// Highest value of `field` across `records`, as a cursor string
pub fn max_cursor_of(records: &[DataRecord], field: &str) -> Option<String> {
    records
        .iter()
        .filter_map(|r| r.get(field))
        .filter(|v| !v.is_null())
        .map(crate::transform::plain_string)
        .fold(None, |acc, v| CheckpointManager::max_cursor(acc, &v))
}
