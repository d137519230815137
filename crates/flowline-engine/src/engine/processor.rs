//! Step processors
//!
//! One [`StepProcessor`] per [`StepType`], each delegating to the connector
//! variant named in the step configuration:
//!
//! | Step      | Selector key                        | Capability        |
//! |-----------|-------------------------------------|-------------------|
//! | Extract   | `connectorType` / `sourceType`      | [`Extractor`]     |
//! | Transform | `transformationType`                | [`Transformer`]   |
//! | Validate  | `validationType` (default inferred) | [`Validator`]     |
//! | Enrich    | `enrichmentType`                    | [`Enricher`]      |
//! | Load      | `connectorType` / `targetType`      | [`Loader`]        |
//! | Branch    | -                                   | [`BranchSpec`]    |
//! | Custom    | `handler`                           | [`CustomStepHandler`] |
//!
//! [`Extractor`]: crate::connectors::Extractor
//! [`Transformer`]: crate::connectors::Transformer
//! [`Validator`]: crate::connectors::Validator
//! [`Enricher`]: crate::connectors::Enricher
//! [`Loader`]: crate::connectors::Loader

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use flowline_common::types::{
    Configuration, ConfigurationExt, DataRecord, DataSourceDefinition, SchemaDefinition,
    StepOutput, StepType, WorkflowStep,
};
use flowline_common::{FlowlineError, Result};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::branch::{resolve_field, BranchSpec};
use crate::checkpoint::CheckpointManager;
use crate::connectors::{
    required_tag, source_from_config, ConnectorRegistry, ConnectorType, EnricherType,
    TransformType, ValidatorType,
};
use crate::context::WorkflowContext;
use crate::repository::WorkflowRepository;

/// Output property carrying the cursor an extract step reached
pub const CHECKPOINT_PROPERTY: &str = "checkpoint";

/// Validation errors kept on a validate step's output
const MAX_REPORTED_ERRORS: usize = 10;

/// Records and outputs handed to a step by its dependencies
#[derive(Debug, Clone, Default)]
pub struct StepInput {
    /// Records of every dependency, concatenated in dependency order
    pub records: Vec<DataRecord>,
    pub upstream: BTreeMap<String, StepOutput>,
}

impl StepInput {
    pub fn new(records: Vec<DataRecord>) -> Self {
        Self {
            records,
            upstream: BTreeMap::new(),
        }
    }

    pub fn from_upstream(outputs: Vec<(String, StepOutput)>) -> Self {
        let records = outputs
            .iter()
            .flat_map(|(_, output)| output.records.iter().cloned())
            .collect();
        Self {
            records,
            upstream: outputs.into_iter().collect(),
        }
    }
}

#[async_trait]
pub trait StepProcessor: Send + Sync {
    fn step_type(&self) -> StepType;

    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput>;
}

/// Named handler behind a Custom step
#[async_trait]
pub trait CustomStepHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput>;
}

/// Forwards its input unchanged
pub struct PassthroughHandler;

#[async_trait]
impl CustomStepHandler for PassthroughHandler {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn handle(
        &self,
        _ctx: &WorkflowContext,
        _step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        Ok(StepOutput::with_records(input.records.clone()))
    }
}

/// Collaborators shared by the built-in processors
#[derive(Clone)]
pub struct ProcessorServices {
    pub connectors: ConnectorRegistry,
    pub checkpoints: CheckpointManager,
    pub repository: Arc<dyn WorkflowRepository>,
}

impl ProcessorServices {
    /// Registered definition named by the first present key in `keys`
    async fn registered(
        &self,
        config: &Configuration,
        keys: &[&str],
    ) -> Result<Option<DataSourceDefinition>> {
        match keys.iter().find_map(|k| config.get_str(k)) {
            Some(id) => self.repository.get_data_source(id).await,
            None => Ok(None),
        }
    }
}

fn connector_of(step: &WorkflowStep, keys: &[&str]) -> Result<ConnectorType> {
    match keys.iter().find(|k| step.configuration.get_str(k).is_some()) {
        Some(key) => required_tag(&step.configuration, key),
        None => Err(FlowlineError::configuration(format!(
            "step '{}' requires '{}'",
            step.id, keys[0]
        ))),
    }
}

pub struct ExtractProcessor {
    services: ProcessorServices,
}

#[async_trait]
impl StepProcessor for ExtractProcessor {
    fn step_type(&self) -> StepType {
        StepType::Extract
    }

    #[instrument(skip_all, fields(step_id = %step.id))]
    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        _input: &StepInput,
    ) -> Result<StepOutput> {
        let config = &step.configuration;
        let connector = connector_of(step, &["connectorType", "sourceType"])?;
        let extractor = self.services.connectors.extractor(connector)?;
        let registered = self.services.registered(config, &["sourceId"]).await?;
        let source = source_from_config(&step.id, connector, config, registered);

        let batch = extractor
            .extract(ctx, config, &source, &self.services.checkpoints)
            .await?;
        info!(
            source_id = %source.id,
            records = batch.records.len(),
            cursor = ?batch.cursor,
            "Extracted records"
        );

        let schema = if config.get_bool("inferSchema").unwrap_or(false) {
            Some(extractor.infer_schema(&source).await?)
        } else {
            None
        };

        let records_processed = batch.records.len() as u64;
        let mut output = StepOutput::with_records(batch.records)
            .with_property("sourceId", json!(source.id));
        if let Some(cursor) = batch.cursor {
            output = output.with_property(
                CHECKPOINT_PROPERTY,
                json!({
                    "sourceId": source.id,
                    "cursor": cursor,
                    "records": records_processed,
                }),
            );
        }
        if let Some(schema) = schema {
            output = output.with_property("schema", serde_json::to_value(schema)?);
        }
        Ok(output)
    }
}

pub struct TransformProcessor {
    services: ProcessorServices,
}

#[async_trait]
impl StepProcessor for TransformProcessor {
    fn step_type(&self) -> StepType {
        StepType::Transform
    }

    /// Applies `transformationType`, or each entry of `transformations` in
    /// order
    #[instrument(skip_all, fields(step_id = %step.id))]
    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        let stages: Vec<&Configuration> = match step.configuration.get_list("transformations") {
            Some(list) => list
                .iter()
                .map(|stage| {
                    stage.as_map().ok_or_else(|| {
                        FlowlineError::configuration(format!(
                            "step '{}': each transformation must be a mapping",
                            step.id
                        ))
                    })
                })
                .collect::<Result<_>>()?,
            None => vec![&step.configuration],
        };

        let mut records = input.records.clone();
        for stage in stages {
            let kind: TransformType = required_tag(stage, "transformationType")?;
            let before = records.len();
            records = self
                .services
                .connectors
                .transformer(kind)?
                .transform(ctx, records, stage)
                .await?;
            debug!(transformation = %kind, before, after = records.len(), "Applied transformation");
        }

        let rejected = input.records.len().saturating_sub(records.len()) as u64;
        Ok(StepOutput {
            records_rejected: rejected,
            ..StepOutput::with_records(records)
        })
    }
}

pub struct ValidateProcessor {
    services: ProcessorServices,
}

impl ValidateProcessor {
    async fn schema(&self, step: &WorkflowStep) -> Result<Option<SchemaDefinition>> {
        if let Some(raw) = step.configuration.value("schema") {
            let schema = serde_json::from_value(raw.to_json()).map_err(|e| {
                FlowlineError::configuration(format!("step '{}': invalid schema: {}", step.id, e))
            })?;
            return Ok(Some(schema));
        }
        Ok(self
            .services
            .registered(&step.configuration, &["sourceId"])
            .await?
            .and_then(|source| source.schema))
    }
}

#[async_trait]
impl StepProcessor for ValidateProcessor {
    fn step_type(&self) -> StepType {
        StepType::Validate
    }

    #[instrument(skip_all, fields(step_id = %step.id))]
    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        let config = &step.configuration;
        let schema = self.schema(step).await?;
        let kind = match config.get_str("validationType") {
            Some(tag) => tag.parse()?,
            None if config.get_list("rules").is_some() => ValidatorType::Rules,
            None => ValidatorType::Schema,
        };

        let outcome = self
            .services
            .connectors
            .validator(kind)?
            .validate(ctx, input.records.clone(), config, schema.as_ref())
            .await?;

        let rejected = outcome.invalid.len();
        if rejected > 0 && config.get_bool("failOnInvalid").unwrap_or(false) {
            let first = outcome
                .invalid
                .first()
                .map(|r| r.errors.join("; "))
                .unwrap_or_default();
            return Err(FlowlineError::execution(format!(
                "{} of {} records failed validation: {}",
                rejected,
                input.records.len(),
                first
            )));
        }

        let errors: Vec<serde_json::Value> = outcome
            .invalid
            .iter()
            .take(MAX_REPORTED_ERRORS)
            .map(|r| json!({"recordId": r.record.id, "errors": r.errors}))
            .collect();
        let mut output = StepOutput::with_records(outcome.valid);
        output.records_processed = input.records.len() as u64;
        output.records_rejected = rejected as u64;
        Ok(output.with_property("validationErrors", json!(errors)))
    }
}

pub struct EnrichProcessor {
    services: ProcessorServices,
}

#[async_trait]
impl StepProcessor for EnrichProcessor {
    fn step_type(&self) -> StepType {
        StepType::Enrich
    }

    #[instrument(skip_all, fields(step_id = %step.id))]
    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        let kind: EnricherType = required_tag(&step.configuration, "enrichmentType")?;
        let records = self
            .services
            .connectors
            .enricher(kind)?
            .enrich(ctx, input.records.clone(), &step.configuration)
            .await?;
        Ok(StepOutput::with_records(records))
    }
}

pub struct LoadProcessor {
    services: ProcessorServices,
}

#[async_trait]
impl StepProcessor for LoadProcessor {
    fn step_type(&self) -> StepType {
        StepType::Load
    }

    #[instrument(skip_all, fields(step_id = %step.id, records = input.records.len()))]
    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        let config = &step.configuration;
        let connector = connector_of(step, &["connectorType", "targetType"])?;
        let loader = self.services.connectors.loader(connector)?;
        let registered = self.services.registered(config, &["targetId", "sourceId"]).await?;
        let target = source_from_config(&step.id, connector, config, registered);

        let result = loader.load(ctx, &input.records, config, &target).await?;
        if result.loaded == 0 && result.failed > 0 {
            return Err(FlowlineError::execution(format!(
                "all {} records failed to load into '{}': {}",
                result.failed,
                target.id,
                result.errors.first().map(String::as_str).unwrap_or("unknown error")
            )));
        }
        info!(
            target_id = %target.id,
            loaded = result.loaded,
            failed = result.failed,
            "Loaded records"
        );

        Ok(StepOutput {
            records: input.records.clone(),
            records_processed: input.records.len() as u64,
            records_loaded: result.loaded,
            records_rejected: result.failed,
            is_success: result.failed == 0,
            ..StepOutput::default()
        }
        .with_property("targetId", json!(target.id))
        .with_property("loadErrors", json!(result.errors)))
    }
}

/// Picks successor edges from the branch condition
pub struct BranchProcessor;

#[async_trait]
impl StepProcessor for BranchProcessor {
    fn step_type(&self) -> StepType {
        StepType::Branch
    }

    #[instrument(skip_all, fields(step_id = %step.id))]
    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        let spec = BranchSpec::parse(&step.configuration)?;
        let actual = resolve_field(ctx, &spec.condition.field, &input.records).await;
        let matched = spec.condition.evaluate(actual.as_ref());
        let selected = spec.select(matched);
        info!(
            field = %spec.condition.field,
            value = ?actual,
            matched,
            selected = ?selected,
            "Branch evaluated"
        );

        ctx.set_metadata(format!("branch.{}", step.id), json!(matched))
            .await;
        Ok(StepOutput {
            selected_branches: Some(selected),
            ..StepOutput::with_records(input.records.clone())
        }
        .with_property("conditionResult", json!(matched)))
    }
}

/// Dispatches Custom steps to handlers by name
pub struct CustomProcessor {
    handlers: HashMap<String, Arc<dyn CustomStepHandler>>,
}

impl CustomProcessor {
    pub fn new(handlers: Vec<Arc<dyn CustomStepHandler>>) -> Self {
        let mut by_name: HashMap<String, Arc<dyn CustomStepHandler>> = HashMap::new();
        by_name.insert("passthrough".to_string(), Arc::new(PassthroughHandler));
        for handler in handlers {
            by_name.insert(handler.name().to_string(), handler);
        }
        Self { handlers: by_name }
    }
}

#[async_trait]
impl StepProcessor for CustomProcessor {
    fn step_type(&self) -> StepType {
        StepType::Custom
    }

    async fn process(
        &self,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        let name = step.configuration.require_str("handler")?;
        let handler = self.handlers.get(name).ok_or_else(|| {
            FlowlineError::configuration(format!("no custom handler registered as '{}'", name))
        })?;
        handler.handle(ctx, step, input).await
    }
}

/// Step type → processor table
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<StepType, Arc<dyn StepProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(
        services: ProcessorServices,
        handlers: Vec<Arc<dyn CustomStepHandler>>,
    ) -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(ExtractProcessor {
                services: services.clone(),
            }))
            .register(Arc::new(TransformProcessor {
                services: services.clone(),
            }))
            .register(Arc::new(ValidateProcessor {
                services: services.clone(),
            }))
            .register(Arc::new(EnrichProcessor {
                services: services.clone(),
            }))
            .register(Arc::new(LoadProcessor { services }))
            .register(Arc::new(BranchProcessor))
            .register(Arc::new(CustomProcessor::new(handlers)));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn StepProcessor>) -> &mut Self {
        self.processors.insert(processor.step_type(), processor);
        self
    }

    pub fn get(&self, step_type: StepType) -> Result<Arc<dyn StepProcessor>> {
        self.processors.get(&step_type).cloned().ok_or_else(|| {
            FlowlineError::configuration(format!(
                "no processor registered for step type '{}'",
                step_type
            ))
        })
    }
}
