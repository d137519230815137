//! Data lineage
//!
//! Each completed step links the entity produced by its upstream steps to
//! the entity it produced, as an Extraction, Transformation or Loading
//! event. Entities keep at most [`MAX_SAMPLE_RECORDS`] sample records, so
//! graph size is independent of data volume.
//!
//! Recording is best effort: [`LineageTracker::record_step`] logs failures
//! and never fails the step that triggered it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_common::types::{ConfigurationExt, DataRecord, StepOutput, StepType, WorkflowStep};
use flowline_common::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::context::WorkflowContext;

/// Sample records stored per entity
pub const MAX_SAMPLE_RECORDS: usize = 5;

/// Configuration keys tried, in order, for an entity's location
const LOCATION_KEYS: [&str; 5] = ["url", "path", "table", "topic", "connectionString"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// Raw input of a step with no upstream entity
    Source,
    /// Intermediate step output
    Dataset,
    /// Records handed to a sink
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineageEventType {
    Extraction,
    Transformation,
    Loading,
}

impl LineageEventType {
    pub fn for_step(step_type: StepType) -> Self {
        match step_type {
            StepType::Extract => LineageEventType::Extraction,
            StepType::Load => LineageEventType::Loading,
            _ => LineageEventType::Transformation,
        }
    }
}

/// Shape of a record set, judged from its field layout
pub fn data_type_label(records: &[DataRecord]) -> &'static str {
    let Some(first) = records.first() else {
        return "empty";
    };
    let nested = records.iter().any(|r| {
        r.fields
            .values()
            .any(|v| v.is_object() || v.is_array())
    });
    if nested {
        return "nested";
    }
    let keys: BTreeSet<&String> = first.fields.keys().collect();
    let uniform = records
        .iter()
        .all(|r| r.fields.keys().collect::<BTreeSet<_>>() == keys);
    if uniform {
        "tabular"
    } else {
        "heterogeneous"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub name: String,
    pub location: Option<String>,
    pub data_type: String,
    pub sample: Vec<serde_json::Value>,
    pub record_count: u64,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl DataEntity {
    pub fn from_records(
        entity_type: EntityType,
        name: impl Into<String>,
        location: Option<String>,
        records: &[DataRecord],
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type,
            name: name.into(),
            location,
            data_type: data_type_label(records).to_string(),
            sample: records
                .iter()
                .take(MAX_SAMPLE_RECORDS)
                .map(DataRecord::to_json)
                .collect(),
            record_count: records.len() as u64,
            properties: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageEvent {
    pub id: String,
    pub event_type: LineageEventType,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// Lineage persistence collaborator
#[async_trait]
pub trait LineageService: Send + Sync {
    async fn record_entity(&self, entity: &DataEntity) -> Result<()>;

    async fn record_event(&self, event: &LineageEvent) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryLineageService {
    entities: RwLock<HashMap<String, DataEntity>>,
    events: RwLock<Vec<LineageEvent>>,
}

impl InMemoryLineageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entity(&self, id: &str) -> Option<DataEntity> {
        self.entities.read().await.get(id).cloned()
    }

    pub async fn events_for(&self, execution_id: &str) -> Vec<LineageEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// Entities `entity_id` was directly derived from
    pub async fn upstream_of(&self, entity_id: &str) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.target_entity_id == entity_id)
            .map(|e| e.source_entity_id.clone())
            .collect()
    }
}

#[async_trait]
impl LineageService for InMemoryLineageService {
    async fn record_entity(&self, entity: &DataEntity) -> Result<()> {
        self.entities
            .write()
            .await
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn record_event(&self, event: &LineageEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// Connects step outputs into the lineage graph
#[derive(Clone)]
pub struct LineageTracker {
    service: Arc<dyn LineageService>,
}

impl LineageTracker {
    pub fn new(service: Arc<dyn LineageService>) -> Self {
        Self { service }
    }

    /// Record lineage for a completed step; failures are only logged
    pub async fn record_step(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &[DataRecord],
        output: &StepOutput,
    ) {
        if let Err(e) = self.try_record_step(ctx, step, input, output).await {
            warn!(
                workflow_id = %ctx.workflow_id,
                execution_id = %ctx.execution_id,
                step_id = %step.id,
                error = %e,
                "Failed to record lineage"
            );
        }
    }

    #[instrument(skip_all, fields(step_id = %step.id))]
    async fn try_record_step(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &[DataRecord],
        output: &StepOutput,
    ) -> Result<()> {
        let mut upstream = Vec::new();
        for dep in &step.depends_on {
            if let Some(id) = ctx.entity_id(dep).await {
                if !upstream.contains(&id) {
                    upstream.push(id);
                }
            }
        }

        // A branch routes records without changing them
        if step.step_type == StepType::Branch {
            if let Some(id) = upstream.first() {
                ctx.set_entity_id(&step.id, id).await;
            }
            return Ok(());
        }

        let location = LOCATION_KEYS
            .iter()
            .find_map(|key| step.configuration.get_str(key))
            .map(str::to_string);

        if upstream.is_empty() {
            let entity = DataEntity::from_records(
                EntityType::Source,
                format!("{} input", step.display_name()),
                location.clone(),
                input,
            );
            self.service.record_entity(&entity).await?;
            upstream.push(entity.id);
        }

        let (entity_type, output_location) = match step.step_type {
            StepType::Load => (EntityType::Sink, location),
            _ => (EntityType::Dataset, None),
        };
        let produced = DataEntity::from_records(
            entity_type,
            step.display_name().to_string(),
            output_location,
            &output.records,
        )
        .with_property("stepType", serde_json::json!(step.step_type.as_str()))
        .with_property("recordsProcessed", serde_json::json!(output.records_processed));
        self.service.record_entity(&produced).await?;

        let event_type = LineageEventType::for_step(step.step_type);
        for source_entity_id in upstream {
            let event = LineageEvent {
                id: Uuid::new_v4().to_string(),
                event_type,
                source_entity_id,
                target_entity_id: produced.id.clone(),
                workflow_id: ctx.workflow_id.clone(),
                execution_id: ctx.execution_id.clone(),
                step_id: step.id.clone(),
                timestamp: Utc::now(),
                properties: BTreeMap::from([
                    ("inputRecords".to_string(), serde_json::json!(input.len())),
                    ("outputRecords".to_string(), serde_json::json!(output.records.len())),
                ]),
            };
            self.service.record_event(&event).await?;
        }

        ctx.set_entity_id(&step.id, &produced.id).await;
        debug!(entity_id = %produced.id, ?event_type, "Lineage recorded");
        Ok(())
    }
}
