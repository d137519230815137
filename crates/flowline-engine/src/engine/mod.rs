//! Workflow engine
//!
//! Runs a [`WorkflowDefinition`] as a [`WorkflowExecution`] in scheduling
//! waves: resolve the ready steps from the dependency graph, run up to
//! `max_parallel_steps` of them concurrently, fold the results back into
//! the execution and repeat until nothing is left to run.
//!
//! Configuration problems (cycles, unknown dependencies, unregistered step
//! types, malformed branches) are reported as `Err` before any step runs.
//! Step failures are not errors of `execute`: they produce an execution in
//! the `Failed` state carrying a [`StepFailure`].
//!
//! Pausing takes effect between waves. Cancellation is observed between
//! waves and, through the context's cancellation token, at the I/O
//! boundaries of running steps.

pub mod branch;
pub mod graph;
pub mod processor;
pub mod retry;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use flowline_common::types::{
    Checkpoint, Configuration, ExecutionStatus, StepOutput, StepStatus, WorkflowDefinition,
    WorkflowExecution, WorkflowStep,
};
use flowline_common::{ErrorKind, FlowlineError, Result, StepFailure};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use graph::{ExecutionPlan, Resolution};
pub use processor::{
    CustomStepHandler, ProcessorRegistry, ProcessorServices, StepInput, StepProcessor,
    CHECKPOINT_PROPERTY,
};
pub use retry::RetryPolicy;

use crate::checkpoint::{create_store, CheckpointManager};
use crate::config::EngineConfig;
use crate::connectors::streaming::{InMemoryBroker, MessageBroker};
use crate::connectors::ConnectorRegistry;
use crate::context::WorkflowContext;
use crate::lineage::{InMemoryLineageService, LineageService, LineageTracker};
use crate::monitor::{MetricsRepository, TimelineEvent, TimelineEventType, WorkflowMonitor};
use crate::repository::{InMemoryWorkflowRepository, WorkflowRepository};

/// Handles for steering a live execution
struct ExecutionControl {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

/// Everything one run needs, created before the first step starts
struct PreparedRun {
    definition: WorkflowDefinition,
    plan: ExecutionPlan,
    ctx: WorkflowContext,
    execution: WorkflowExecution,
    pause: watch::Receiver<bool>,
}

/// What running one step produced
struct StepOutcome {
    step_id: String,
    result: Result<StepOutput>,
    retries: u32,
    max_retries: u32,
}

/// An execution running on its own task
pub struct RunningExecution {
    pub execution_id: String,
    handle: JoinHandle<WorkflowExecution>,
}

impl RunningExecution {
    /// Wait for the execution to reach a terminal state
    pub async fn wait(self) -> Result<WorkflowExecution> {
        self.handle
            .await
            .map_err(|e| FlowlineError::execution(format!("execution task failed: {}", e)))
    }
}

struct EngineInner {
    config: EngineConfig,
    processors: ProcessorRegistry,
    checkpoints: CheckpointManager,
    repository: Arc<dyn WorkflowRepository>,
    monitor: Arc<WorkflowMonitor>,
    lineage: LineageTracker,
    running: Mutex<HashMap<String, ExecutionControl>>,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    connectors: Option<ConnectorRegistry>,
    broker: Option<Arc<dyn MessageBroker>>,
    checkpoints: Option<CheckpointManager>,
    repository: Option<Arc<dyn WorkflowRepository>>,
    metrics: Option<Arc<dyn MetricsRepository>>,
    lineage: Option<Arc<dyn LineageService>>,
    handlers: Vec<Arc<dyn CustomStepHandler>>,
    processors: Vec<Arc<dyn StepProcessor>>,
}

impl WorkflowEngineBuilder {
    /// Replace the default connector registry
    pub fn connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = Some(connectors);
        self
    }

    /// Broker behind the default streaming connector
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Replace the store selected by `checkpoint.store_type`
    pub fn checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn WorkflowRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRepository>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn lineage_service(mut self, service: Arc<dyn LineageService>) -> Self {
        self.lineage = Some(service);
        self
    }

    pub fn custom_handler(mut self, handler: Arc<dyn CustomStepHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Override the built-in processor for the processor's step type
    pub fn processor(mut self, processor: Arc<dyn StepProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub async fn build(self) -> Result<WorkflowEngine> {
        let connectors = match self.connectors {
            Some(connectors) => connectors,
            None => {
                let poll_interval = self.config.streaming.poll_interval();
                let broker = self.broker.unwrap_or_else(|| {
                    Arc::new(InMemoryBroker::new(poll_interval)) as Arc<dyn MessageBroker>
                });
                ConnectorRegistry::with_defaults(&self.config, broker)?
            },
        };
        let checkpoints = match self.checkpoints {
            Some(checkpoints) => checkpoints,
            None => CheckpointManager::new(create_store(&self.config.checkpoint).await?),
        };

        // The in-memory repository doubles as the metrics sink unless the
        // caller supplied either collaborator
        let (repository, default_metrics): (_, Option<Arc<dyn MetricsRepository>>) =
            match self.repository {
                Some(repository) => (repository, None),
                None => {
                    let repository = Arc::new(InMemoryWorkflowRepository::new());
                    let metrics = repository.clone() as Arc<dyn MetricsRepository>;
                    (repository as Arc<dyn WorkflowRepository>, Some(metrics))
                },
            };
        let mut monitor = WorkflowMonitor::new(self.config.monitor.timeline_capacity);
        if let Some(metrics) = self.metrics.or(default_metrics) {
            monitor = monitor.with_metrics(metrics);
        }
        let lineage = LineageTracker::new(
            self.lineage.unwrap_or_else(|| {
                Arc::new(InMemoryLineageService::new()) as Arc<dyn LineageService>
            }),
        );

        let services = ProcessorServices {
            connectors,
            checkpoints: checkpoints.clone(),
            repository: repository.clone(),
        };
        let mut processors = ProcessorRegistry::with_defaults(services, self.handlers);
        for processor in self.processors {
            processors.register(processor);
        }

        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                processors,
                checkpoints,
                repository,
                monitor: Arc::new(monitor),
                lineage,
                running: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl WorkflowEngine {
    pub fn builder(config: EngineConfig) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config,
            connectors: None,
            broker: None,
            checkpoints: None,
            repository: None,
            metrics: None,
            lineage: None,
            handlers: Vec::new(),
            processors: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn monitor(&self) -> &Arc<WorkflowMonitor> {
        &self.inner.monitor
    }

    pub fn repository(&self) -> &Arc<dyn WorkflowRepository> {
        &self.inner.repository
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.inner.checkpoints
    }

    /// Check a definition without running it
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<ExecutionPlan> {
        let plan = ExecutionPlan::build(definition)?;
        for step in &definition.steps {
            self.inner.processors.get(step.step_type).map_err(|e| {
                FlowlineError::configuration(format!("step '{}': {}", step.id, e))
            })?;
        }
        Ok(plan)
    }

    /// Validate and store a definition so it can be run by id
    pub async fn register_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.validate(definition)?;
        self.inner.repository.save_definition(definition).await?;
        info!(workflow_id = %definition.id, steps = definition.steps.len(), "Workflow registered");
        Ok(())
    }

    async fn definition(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        self.inner
            .repository
            .get_definition(workflow_id)
            .await?
            .ok_or_else(|| {
                FlowlineError::configuration(format!("unknown workflow '{}'", workflow_id))
            })
    }

    /// Run a registered workflow to completion
    pub async fn execute(
        &self,
        workflow_id: &str,
        parameters: Configuration,
    ) -> Result<WorkflowExecution> {
        let definition = self.definition(workflow_id).await?;
        self.execute_definition(&definition, parameters).await
    }

    /// Run `definition` to completion without registering it
    pub async fn execute_definition(
        &self,
        definition: &WorkflowDefinition,
        parameters: Configuration,
    ) -> Result<WorkflowExecution> {
        let prepared = self.prepare(definition.clone(), parameters).await?;
        Ok(self.run(prepared).await)
    }

    /// Start a registered workflow on its own task
    pub async fn spawn(
        &self,
        workflow_id: &str,
        parameters: Configuration,
    ) -> Result<RunningExecution> {
        let definition = self.definition(workflow_id).await?;
        self.spawn_definition(definition, parameters).await
    }

    pub async fn spawn_definition(
        &self,
        definition: WorkflowDefinition,
        parameters: Configuration,
    ) -> Result<RunningExecution> {
        let prepared = self.prepare(definition, parameters).await?;
        let execution_id = prepared.execution.id.clone();
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run(prepared).await });
        Ok(RunningExecution {
            execution_id,
            handle,
        })
    }

    /// Latest persisted snapshot of an execution
    pub async fn get_status(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        self.inner.repository.get_execution(execution_id).await
    }

    /// Request cancellation; false when the execution is not running
    pub async fn cancel(&self, execution_id: &str) -> bool {
        match self.inner.running.lock().await.get(execution_id) {
            Some(control) => {
                info!(execution_id, "Cancellation requested");
                control.cancel.cancel();
                true
            },
            None => false,
        }
    }

    /// Hold the execution before its next wave
    pub async fn pause(&self, execution_id: &str) -> bool {
        self.set_paused(execution_id, true).await
    }

    pub async fn resume(&self, execution_id: &str) -> bool {
        self.set_paused(execution_id, false).await
    }

    async fn set_paused(&self, execution_id: &str, paused: bool) -> bool {
        match self.inner.running.lock().await.get(execution_id) {
            Some(control) => {
                control.pause.send_replace(paused);
                true
            },
            None => false,
        }
    }

    async fn prepare(
        &self,
        definition: WorkflowDefinition,
        parameters: Configuration,
    ) -> Result<PreparedRun> {
        let plan = self.validate(&definition)?;
        let execution = WorkflowExecution::new(&definition, parameters.clone());
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let ctx = WorkflowContext::new(&definition.id, &execution.id, parameters, cancel.clone());

        self.inner.repository.save_execution(&execution).await?;
        self.inner.running.lock().await.insert(
            execution.id.clone(),
            ExecutionControl {
                cancel,
                pause: pause_tx,
            },
        );
        Ok(PreparedRun {
            definition,
            plan,
            ctx,
            execution,
            pause: pause_rx,
        })
    }

    #[instrument(
        skip_all,
        fields(
            workflow_id = %prepared.definition.id,
            execution_id = %prepared.execution.id
        )
    )]
    async fn run(&self, prepared: PreparedRun) -> WorkflowExecution {
        let PreparedRun {
            definition,
            plan,
            ctx,
            mut execution,
            mut pause,
        } = prepared;

        self.transition(&mut execution, ExecutionStatus::Running);
        self.persist(&execution).await;
        self.record(TimelineEvent::execution(
            &definition.id,
            &execution.id,
            TimelineEventType::ExecutionStarted,
        ))
        .await;
        info!(steps = plan.len(), "Execution started");

        let outcome = loop {
            if ctx.is_cancelled() {
                break ExecutionStatus::Cancelled;
            }
            let paused = *pause.borrow_and_update();
            if paused && !self.wait_while_paused(&ctx, &mut execution, &mut pause).await {
                break ExecutionStatus::Cancelled;
            }

            let resolution = plan.resolve(&execution.step_results);
            for step_id in &resolution.skipped {
                self.skip_step(&definition, &mut execution, step_id, "upstream step did not run")
                    .await;
            }
            if resolution.ready.is_empty() {
                if resolution.skipped.is_empty() {
                    break ExecutionStatus::Completed;
                }
                continue;
            }

            if let Some(failure) =
                self.run_wave(&definition, &plan, &ctx, &mut execution, resolution.ready).await
            {
                let pending: Vec<String> = execution
                    .step_results
                    .values()
                    .filter(|r| r.status == StepStatus::Pending)
                    .map(|r| r.step_id.clone())
                    .collect();
                for step_id in &pending {
                    self.skip_step(&definition, &mut execution, step_id, "execution failed")
                        .await;
                }
                execution.error = Some(failure.to_string());
                execution.failure = Some(failure);
                break ExecutionStatus::Failed;
            }
            self.persist(&execution).await;
        };

        match outcome {
            ExecutionStatus::Completed => self.save_checkpoints(&execution).await,
            ExecutionStatus::Cancelled => {
                for result in execution.step_results.values_mut() {
                    if !result.status.is_terminal() {
                        result.status = StepStatus::Cancelled;
                        result.completed_at = Some(Utc::now());
                    }
                }
                execution.error = Some("execution cancelled".to_string());
            },
            _ => {},
        }

        self.transition(&mut execution, outcome);
        self.persist(&execution).await;
        if let Some(event_type) = TimelineEventType::for_terminal(execution.status) {
            self.record(TimelineEvent::execution(&definition.id, &execution.id, event_type))
                .await;
        }
        self.inner.monitor.execution_finished(&execution).await;
        self.inner.running.lock().await.remove(&execution.id);
        info!(status = %execution.status, "Execution finished");
        execution
    }

    /// Block between waves until resumed. Returns false when cancelled.
    async fn wait_while_paused(
        &self,
        ctx: &WorkflowContext,
        execution: &mut WorkflowExecution,
        pause: &mut watch::Receiver<bool>,
    ) -> bool {
        self.transition(execution, ExecutionStatus::Paused);
        self.persist(execution).await;
        self.record(TimelineEvent::execution(
            &ctx.workflow_id,
            &ctx.execution_id,
            TimelineEventType::ExecutionPaused,
        ))
        .await;
        info!("Execution paused");

        while *pause.borrow_and_update() {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return false,
                changed = pause.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }

        self.transition(execution, ExecutionStatus::Running);
        self.persist(execution).await;
        self.record(TimelineEvent::execution(
            &ctx.workflow_id,
            &ctx.execution_id,
            TimelineEventType::ExecutionResumed,
        ))
        .await;
        info!("Execution resumed");
        true
    }

    /// Run `ready` steps and fold their outcomes into `execution` as they
    /// finish. Once a step exhausts its retries no further step of the wave
    /// is started; those stay `Pending`. Returns the first such failure.
    async fn run_wave(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        ctx: &WorkflowContext,
        execution: &mut WorkflowExecution,
        ready: Vec<String>,
    ) -> Option<StepFailure> {
        let parallelism = self.inner.config.engine.max_parallel_steps.max(1);
        let mut queue: VecDeque<&WorkflowStep> =
            ready.iter().filter_map(|id| definition.step(id)).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<StepFailure> = None;

        loop {
            let mut started = false;
            while failure.is_none() && in_flight.len() < parallelism {
                let Some(step) = queue.pop_front() else {
                    break;
                };
                let upstream: Vec<(String, StepOutput)> = plan
                    .dependencies(&step.id)
                    .into_iter()
                    .filter_map(|dep| execution.output(&dep).cloned().map(|out| (dep, out)))
                    .collect();
                if let Some(result) = execution.step_results.get_mut(&step.id) {
                    result.status = StepStatus::Running;
                    result.started_at = Some(Utc::now());
                }
                in_flight.push(self.run_step(
                    definition,
                    ctx,
                    step,
                    StepInput::from_upstream(upstream),
                ));
                started = true;
            }
            if started {
                self.persist(execution).await;
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            if let Some(f) = self.apply_outcome(definition, execution, outcome).await {
                failure.get_or_insert(f);
            }
        }

        if failure.is_some() && !queue.is_empty() {
            debug!(not_started = queue.len(), "Wave halted after step failure");
        }
        failure
    }

    async fn apply_outcome(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        outcome: StepOutcome,
    ) -> Option<StepFailure> {
        let step = definition.step(&outcome.step_id)?;
        let execution_id = execution.id.clone();
        let result = execution.step_results.get_mut(&outcome.step_id)?;
        result.retry_count = outcome.retries;
        result.completed_at = Some(Utc::now());

        match outcome.result {
            Ok(output) => {
                result.status = StepStatus::Completed;
                self.record(
                    TimelineEvent::step(
                        &definition.id,
                        &execution_id,
                        &step.id,
                        TimelineEventType::StepCompleted,
                    )
                    .with_property("recordsProcessed", serde_json::json!(output.records_processed)),
                )
                .await;
                self.inner
                    .monitor
                    .step_finished(
                        &definition.id,
                        step.step_type,
                        StepStatus::Completed,
                        output.records_processed,
                    )
                    .await;
                result.output = Some(output);
                None
            },
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                result.status = StepStatus::Cancelled;
                result.error = Some(e.to_string());
                None
            },
            Err(e) => {
                result.status = StepStatus::Failed;
                result.error = Some(e.to_string());
                let failure = StepFailure {
                    workflow_id: definition.id.clone(),
                    execution_id: execution_id.clone(),
                    step_id: step.id.clone(),
                    step_name: step.display_name().to_string(),
                    step_type: step.step_type,
                    error_kind: e.kind(),
                    message: e.to_string(),
                    retry_count: outcome.retries,
                    max_retries: outcome.max_retries,
                };
                error!(
                    workflow_id = %failure.workflow_id,
                    execution_id = %failure.execution_id,
                    step_id = %failure.step_id,
                    step_name = %failure.step_name,
                    step_type = %failure.step_type,
                    error_kind = %failure.error_kind,
                    retry_count = failure.retry_count,
                    max_retries = failure.max_retries,
                    error = %failure.message,
                    "Step failed"
                );
                self.record(
                    TimelineEvent::step(
                        &definition.id,
                        &execution_id,
                        &step.id,
                        TimelineEventType::StepFailed,
                    )
                    .with_message(e.to_string())
                    .with_attempt(outcome.retries),
                )
                .await;
                self.inner
                    .monitor
                    .step_finished(&definition.id, step.step_type, StepStatus::Failed, 0)
                    .await;
                Some(failure)
            },
        }
    }

    /// One step with retry, timeout and cancellation
    #[instrument(skip_all, fields(step_id = %step.id, step_type = %step.step_type))]
    async fn run_step(
        &self,
        definition: &WorkflowDefinition,
        ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: StepInput,
    ) -> StepOutcome {
        let config = &self.inner.config;
        let policy =
            RetryPolicy::resolve(&config.retry, &definition.configuration, &step.configuration);
        let timeout = retry::step_timeout(
            config.step_timeout(),
            &definition.configuration,
            &step.configuration,
        );
        let outcome = |result, retries| StepOutcome {
            step_id: step.id.clone(),
            result,
            retries,
            max_retries: policy.max_retries,
        };

        let processor = match self.inner.processors.get(step.step_type) {
            Ok(processor) => processor,
            Err(e) => return outcome(Err(e), 0),
        };

        let mut attempt = 0u32;
        loop {
            self.record(
                TimelineEvent::step(
                    &ctx.workflow_id,
                    &ctx.execution_id,
                    &step.id,
                    TimelineEventType::StepStarted,
                )
                .with_attempt(attempt),
            )
            .await;
            debug!(attempt, ?timeout, "Step attempt started");

            let result = tokio::select! {
                biased;
                _ = ctx.cancellation().cancelled() => Err(FlowlineError::cancelled(format!(
                    "step '{}' cancelled",
                    step.id
                ))),
                result = tokio::time::timeout(timeout, processor.process(ctx, step, &input)) => {
                    match result {
                        Ok(result) => result,
                        Err(_) => Err(FlowlineError::timeout(format!(
                            "step '{}' exceeded its {:?} timeout",
                            step.id, timeout
                        ))),
                    }
                },
            };

            match result {
                Ok(output) => {
                    self.inner
                        .lineage
                        .record_step(ctx, step, &input.records, &output)
                        .await;
                    return outcome(Ok(output), attempt);
                },
                Err(e) if policy.should_retry(&e, attempt) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step attempt failed, retrying"
                    );
                    self.record(
                        TimelineEvent::step(
                            &ctx.workflow_id,
                            &ctx.execution_id,
                            &step.id,
                            TimelineEventType::StepRetried,
                        )
                        .with_attempt(attempt)
                        .with_message(e.to_string()),
                    )
                    .await;
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => {
                            return outcome(
                                Err(FlowlineError::cancelled(format!(
                                    "step '{}' cancelled while waiting to retry",
                                    step.id
                                ))),
                                attempt,
                            );
                        },
                        _ = tokio::time::sleep(delay) => {},
                    }
                    attempt += 1;
                },
                Err(e) => return outcome(Err(e), attempt),
            }
        }
    }

    async fn skip_step(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        step_id: &str,
        reason: &str,
    ) {
        let Some(result) = execution.step_results.get_mut(step_id) else {
            return;
        };
        result.status = StepStatus::Skipped;
        result.completed_at = Some(Utc::now());
        let step_type = result.step_type;
        debug!(step_id, reason, "Step skipped");
        self.record(
            TimelineEvent::step(
                &definition.id,
                &execution.id,
                step_id,
                TimelineEventType::StepSkipped,
            )
            .with_message(reason),
        )
        .await;
        self.inner
            .monitor
            .step_finished(&definition.id, step_type, StepStatus::Skipped, 0)
            .await;
    }

    /// Persist the cursors reached by completed extract steps
    async fn save_checkpoints(&self, execution: &WorkflowExecution) {
        for result in execution.step_results.values() {
            let Some(raw) = result
                .output
                .as_ref()
                .and_then(|o| o.properties.get(CHECKPOINT_PROPERTY))
            else {
                continue;
            };
            let (Some(source_id), Some(cursor)) = (
                raw.get("sourceId").and_then(|v| v.as_str()),
                raw.get("cursor").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let records = raw.get("records").and_then(|v| v.as_u64()).unwrap_or(0);
            let checkpoint = Checkpoint::new(source_id, cursor, records);
            match self.inner.checkpoints.save(&checkpoint).await {
                Ok(true) => debug!(source_id, cursor, "Checkpoint advanced"),
                Ok(false) => {},
                Err(e) => warn!(
                    execution_id = %execution.id,
                    source_id,
                    error = %e,
                    "Failed to persist checkpoint"
                ),
            }
        }
    }

    fn transition(&self, execution: &mut WorkflowExecution, next: ExecutionStatus) {
        if let Err(e) = execution.transition(next) {
            warn!(execution_id = %execution.id, error = %e, "Ignoring status change");
        }
    }

    async fn persist(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.inner.repository.save_execution(execution).await {
            warn!(execution_id = %execution.id, error = %e, "Failed to persist execution");
        }
    }

    async fn record(&self, event: TimelineEvent) {
        self.inner.monitor.record(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowline_common::types::{DataRecord, StepType};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a connection error until `fail_times` attempts were made
    struct Flaky {
        attempts: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl CustomStepHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(
            &self,
            _ctx: &WorkflowContext,
            _step: &WorkflowStep,
            _input: &StepInput,
        ) -> Result<StepOutput> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(FlowlineError::connection("upstream refused"));
            }
            Ok(StepOutput::with_records(vec![DataRecord::from_json(
                "flaky",
                json!({"attempt": n}),
            )]))
        }
    }

    async fn engine(handler: Arc<Flaky>) -> WorkflowEngine {
        WorkflowEngine::builder(EngineConfig::default())
            .checkpoints(CheckpointManager::in_memory())
            .custom_handler(handler)
            .build()
            .await
            .unwrap()
    }

    fn custom(id: &str, handler: &str) -> WorkflowStep {
        WorkflowStep::new(id, StepType::Custom)
            .with_config("handler", handler)
            .with_config("retryDelayMs", 1u64)
    }

    #[tokio::test]
    async fn test_retry_reinvokes_only_the_failing_step() {
        let flaky = Arc::new(Flaky {
            attempts: AtomicU32::new(0),
            fail_times: 2,
        });
        let engine = engine(flaky.clone()).await;
        let definition = WorkflowDefinition::new("wf", "wf")
            .with_step(custom("first", "passthrough"))
            .with_step(custom("second", "flaky").depends_on(["first"]));

        let execution = engine
            .execute_definition(&definition, Configuration::new())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(execution.step_results["second"].retry_count, 2);
        assert_eq!(execution.step_results["first"].retry_count, 0);
        let started_first = engine
            .monitor()
            .events_for(&execution.id)
            .await
            .into_iter()
            .filter(|e| {
                e.event_type == TimelineEventType::StepStarted
                    && e.step_id.as_deref() == Some("first")
            })
            .count();
        assert_eq!(started_first, 1);
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let flaky = Arc::new(Flaky {
            attempts: AtomicU32::new(0),
            fail_times: u32::MAX,
        });
        let engine = engine(flaky).await;
        let definition = WorkflowDefinition::new("wf", "wf")
            .with_step(custom("broken", "flaky").with_config("maxRetries", 1u64))
            .with_step(custom("first", "passthrough"))
            .with_step(custom("after", "passthrough").depends_on(["broken"]))
            .with_step(custom("late", "passthrough").depends_on(["first"]));

        let execution = engine
            .execute_definition(&definition, Configuration::new())
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Failed);
        let failure = execution.failure.clone().unwrap();
        assert_eq!(failure.step_id, "broken");
        assert_eq!(failure.retry_count, 1);
        assert_eq!(failure.max_retries, 1);
        assert_eq!(failure.error_kind, ErrorKind::Connection);
        assert_eq!(execution.step_status("after"), Some(StepStatus::Skipped));
        // Independent of `broken`, but queued behind it in the same wave
        assert_eq!(execution.step_status("first"), Some(StepStatus::Skipped));
        assert_eq!(execution.step_status("late"), Some(StepStatus::Skipped));
        let started: Vec<_> = engine
            .monitor()
            .events_for(&execution.id)
            .await
            .into_iter()
            .filter(|e| e.event_type == TimelineEventType::StepStarted)
            .filter_map(|e| e.step_id)
            .collect();
        assert_eq!(started, vec!["broken".to_string(), "broken".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_handler_are_configuration_errors() {
        let engine = engine(Arc::new(Flaky {
            attempts: AtomicU32::new(0),
            fail_times: 0,
        }))
        .await;
        let err = engine.execute("missing", Configuration::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let definition =
            WorkflowDefinition::new("wf", "wf").with_step(custom("c", "not-registered"));
        let execution = engine
            .execute_definition(&definition, Configuration::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_results["c"].retry_count, 0);
    }

    #[tokio::test]
    async fn test_status_is_persisted() {
        let engine = engine(Arc::new(Flaky {
            attempts: AtomicU32::new(0),
            fail_times: 0,
        }))
        .await;
        let definition = WorkflowDefinition::new("wf", "wf").with_step(custom("a", "flaky"));
        engine.register_workflow(&definition).await.unwrap();

        let execution = engine.execute("wf", Configuration::new()).await.unwrap();
        let stored = engine.get_status(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(!engine.cancel(&execution.id).await);
    }
}
