//! End-to-end workflow execution tests
//!
//! Pipelines run against temporary files, the in-process broker and custom
//! step handlers; no external services are needed.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{engine, extract_file, load_file, read_lines, test_config, write_orders};
use flowline_common::types::{
    ConfigValue, Configuration, DataSourceDefinition, ExecutionStatus, StepOutput, StepStatus,
    StepType, WorkflowDefinition, WorkflowStep,
};
use flowline_common::{ErrorKind, FlowlineError, Result};
use flowline_engine::checkpoint::CheckpointManager;
use flowline_engine::connectors::streaming::InMemoryBroker;
use flowline_engine::connectors::{Batch, ConnectorRegistry, ConnectorType, Extractor, FetchParams};
use flowline_engine::engine::{CustomStepHandler, StepInput};
use flowline_engine::lineage::InMemoryLineageService;
use flowline_engine::monitor::TimelineEventType;
use flowline_engine::repository::InMemoryWorkflowRepository;
use flowline_engine::{WorkflowContext, WorkflowEngine};
use serde_json::json;

fn custom(id: &str, handler: &str) -> WorkflowStep {
    WorkflowStep::new(id, StepType::Custom).with_config("handler", handler)
}

fn filter_active(id: &str, dep: &str) -> WorkflowStep {
    WorkflowStep::new(id, StepType::Transform)
        .with_config("transformationType", "filter")
        .with_config("filterConditions", ConfigValue::from(json!({"status": "active"})))
        .depends_on([dep])
}

fn params(pairs: &[(&str, &str)]) -> Configuration {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), ConfigValue::from(*v)))
        .collect()
}

/// Poll the persisted status until it matches
async fn wait_for_status(engine: &WorkflowEngine, execution_id: &str, status: ExecutionStatus) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = engine.get_status(execution_id).await.unwrap().map(|e| e.status);
            if current == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("execution never reached {}", status));
}

/// Records handler start/finish order and holds each step for `hold`
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
    hold: Duration,
}

#[async_trait]
impl CustomStepHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(
        &self,
        _ctx: &WorkflowContext,
        step: &WorkflowStep,
        input: &StepInput,
    ) -> Result<StepOutput> {
        self.log.lock().unwrap().push(format!("start:{}", step.id));
        tokio::time::sleep(self.hold).await;
        self.log.lock().unwrap().push(format!("end:{}", step.id));
        Ok(StepOutput::with_records(input.records.clone()))
    }
}

/// Never finishes on its own
struct Stall;

#[async_trait]
impl CustomStepHandler for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    async fn handle(
        &self,
        _ctx: &WorkflowContext,
        _step: &WorkflowStep,
        _input: &StepInput,
    ) -> Result<StepOutput> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(StepOutput::default())
    }
}

/// Fails every attempt with an execution error
struct Boom;

#[async_trait]
impl CustomStepHandler for Boom {
    fn name(&self) -> &str {
        "boom"
    }

    async fn handle(
        &self,
        _ctx: &WorkflowContext,
        step: &WorkflowStep,
        _input: &StepInput,
    ) -> Result<StepOutput> {
        Err(FlowlineError::execution(format!("{} blew up", step.id)))
    }
}

/// REST extractor stand-in that is always unreachable
struct Unreachable {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Extractor for Unreachable {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Rest
    }

    async fn validate_connection(&self, _source: &DataSourceDefinition) -> Result<bool> {
        Ok(false)
    }

    async fn fetch_data(
        &self,
        source: &DataSourceDefinition,
        _params: &FetchParams,
    ) -> Result<Batch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FlowlineError::connection(format!("{} refused the connection", source.id)))
    }
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_step_runs() {
    let engine = engine(test_config()).await;
    let definition = WorkflowDefinition::new("cyclic", "Cyclic")
        .with_step(custom("a", "passthrough").depends_on(["c"]))
        .with_step(custom("b", "passthrough").depends_on(["a"]))
        .with_step(custom("c", "passthrough").depends_on(["b"]));

    let err = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(engine.monitor().is_empty().await);
    assert!(engine.register_workflow(&definition).await.is_err());
}

#[tokio::test]
async fn test_extract_filter_load_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_orders(dir.path());
    let output = dir.path().join("out").join("active.jsonl");

    let repository = Arc::new(InMemoryWorkflowRepository::new());
    let lineage = Arc::new(InMemoryLineageService::new());
    let engine = WorkflowEngine::builder(test_config())
        .checkpoints(CheckpointManager::in_memory())
        .repository(repository.clone())
        .metrics(repository.clone())
        .lineage_service(lineage.clone())
        .build()
        .await
        .unwrap();

    let definition = WorkflowDefinition::new("orders", "Active orders")
        .with_step(extract_file("extract", &input))
        .with_step(filter_active("filter", "extract"))
        .with_step(load_file("load", &output).depends_on(["filter"]));
    engine.register_workflow(&definition).await.unwrap();

    let execution = engine.execute("orders", Configuration::new()).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(execution.started_at.is_some() && execution.completed_at.is_some());
    let load = execution.output("load").unwrap();
    assert_eq!(load.records_processed, 4);
    assert_eq!(load.records_loaded, 4);
    assert!(load.is_success);
    assert_eq!(execution.output("extract").unwrap().records_processed, 10);
    assert_eq!(execution.output("filter").unwrap().records_rejected, 6);

    let written = read_lines(&output);
    assert_eq!(written.len(), 4);
    assert!(written.iter().all(|row| row["status"] == "active"));

    let metrics = repository.metrics("orders").await;
    assert_eq!(metrics.executions_completed, 1);
    assert_eq!(metrics.steps_completed, 3);

    let events = lineage.events_for(&execution.id).await;
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_failing_extract_is_retried_then_fails() {
    let config = test_config();
    let calls = Arc::new(AtomicU32::new(0));
    let mut connectors =
        ConnectorRegistry::with_defaults(&config, Arc::new(InMemoryBroker::default())).unwrap();
    connectors.register_extractor(Arc::new(Unreachable {
        calls: calls.clone(),
    }));
    let engine = WorkflowEngine::builder(config)
        .connectors(connectors)
        .checkpoints(CheckpointManager::in_memory())
        .build()
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let definition = WorkflowDefinition::new("flaky", "Flaky source")
        .with_step(
            WorkflowStep::new("extract", StepType::Extract)
                .with_config("connectorType", "rest")
                .with_config("url", "http://orders.invalid/api"),
        )
        .with_step(load_file("load", &dir.path().join("never.jsonl")).depends_on(["extract"]));

    let execution = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let monitor = engine.monitor();
    assert_eq!(monitor.count(&execution.id, TimelineEventType::StepRetried).await, 3);
    assert_eq!(monitor.count(&execution.id, TimelineEventType::StepStarted).await, 4);
    assert_eq!(monitor.count(&execution.id, TimelineEventType::ExecutionFailed).await, 1);

    let failure = execution.failure.as_ref().unwrap();
    assert_eq!(failure.step_id, "extract");
    assert_eq!(failure.step_type, StepType::Extract);
    assert_eq!(failure.error_kind, ErrorKind::Connection);
    assert_eq!(failure.retry_count, 3);
    assert_eq!(failure.max_retries, 3);
    assert_eq!(execution.step_status("load"), Some(StepStatus::Skipped));
    assert!(!dir.path().join("never.jsonl").exists());
}

fn branch_definition(dir: &std::path::Path) -> WorkflowDefinition {
    let input = write_orders(dir);
    WorkflowDefinition::new("routing", "Regional routing")
        .with_step(extract_file("extract", &input))
        .with_step(
            WorkflowStep::new("route", StepType::Branch)
                .with_config(
                    "condition",
                    ConfigValue::from(json!({"field": "region", "operator": "==", "value": "US"})),
                )
                .with_config("trueBranch", ConfigValue::from(json!(["us"])))
                .with_config("falseBranch", ConfigValue::from(json!(["intl"])))
                .depends_on(["extract"]),
        )
        .with_step(load_file("us", &dir.join("us.jsonl")).depends_on(["route"]))
        .with_step(load_file("intl", &dir.join("intl.jsonl")).depends_on(["route"]))
        .with_step(custom("audit", "passthrough").depends_on(["intl"]))
}

#[tokio::test]
async fn test_branch_selection_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(test_config()).await;
    let definition = branch_definition(dir.path());

    for _ in 0..3 {
        let execution = engine
            .execute_definition(&definition, params(&[("region", "US")]))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_status("us"), Some(StepStatus::Completed));
        assert_eq!(execution.step_status("intl"), Some(StepStatus::Skipped));
        assert_eq!(execution.step_status("audit"), Some(StepStatus::Skipped));
        assert_eq!(
            execution.output("route").unwrap().selected_branches,
            Some(vec!["us".to_string()])
        );
    }
    assert!(!dir.path().join("intl.jsonl").exists());

    let execution = engine
        .execute_definition(&definition, params(&[("region", "EU")]))
        .await
        .unwrap();
    assert_eq!(execution.step_status("us"), Some(StepStatus::Skipped));
    assert_eq!(execution.step_status("intl"), Some(StepStatus::Completed));
    assert_eq!(execution.step_status("audit"), Some(StepStatus::Completed));
}

#[tokio::test]
async fn test_branch_falls_back_to_first_record() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(test_config()).await;

    // Order 0 is a US order
    let execution = engine
        .execute_definition(&branch_definition(dir.path()), Configuration::new())
        .await
        .unwrap();
    assert_eq!(execution.step_status("us"), Some(StepStatus::Completed));
    assert_eq!(execution.step_status("intl"), Some(StepStatus::Skipped));
}

fn diamond() -> WorkflowDefinition {
    WorkflowDefinition::new("diamond", "Diamond")
        .with_step(custom("d", "recorder").depends_on(["b", "c"]))
        .with_step(custom("b", "recorder").depends_on(["a"]))
        .with_step(custom("c", "recorder").depends_on(["a"]))
        .with_step(custom("a", "recorder"))
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("missing {}", entry))
}

#[tokio::test]
async fn test_steps_start_only_after_dependencies_complete() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut config = test_config();
    config.engine.max_parallel_steps = 4;
    let engine = WorkflowEngine::builder(config)
        .checkpoints(CheckpointManager::in_memory())
        .custom_handler(Arc::new(Recorder {
            log: log.clone(),
            hold: Duration::from_millis(20),
        }))
        .build()
        .await
        .unwrap();

    let execution = engine
        .execute_definition(&diamond(), Configuration::new())
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let log = log.lock().unwrap().clone();
    assert_eq!(log.len(), 8);
    assert!(position(&log, "end:a") < position(&log, "start:b"));
    assert!(position(&log, "end:a") < position(&log, "start:c"));
    assert!(position(&log, "end:b") < position(&log, "start:d"));
    assert!(position(&log, "end:c") < position(&log, "start:d"));
    // b and c are independent and ran side by side
    assert!(position(&log, "start:c") < position(&log, "end:b"));
    assert!(position(&log, "start:b") < position(&log, "end:c"));
}

#[tokio::test]
async fn test_sequential_by_default() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::builder(test_config())
        .checkpoints(CheckpointManager::in_memory())
        .custom_handler(Arc::new(Recorder {
            log: log.clone(),
            hold: Duration::from_millis(5),
        }))
        .build()
        .await
        .unwrap();

    engine
        .execute_definition(&diamond(), Configuration::new())
        .await
        .unwrap();

    let log = log.lock().unwrap().clone();
    for pair in log.chunks(2) {
        let started = pair[0].strip_prefix("start:").unwrap();
        assert_eq!(pair[1], format!("end:{}", started));
    }
}

#[tokio::test]
async fn test_step_timeout_fails_the_step() {
    let engine = WorkflowEngine::builder(test_config())
        .checkpoints(CheckpointManager::in_memory())
        .custom_handler(Arc::new(Stall))
        .build()
        .await
        .unwrap();
    let definition = WorkflowDefinition::new("slow", "Slow").with_step(
        custom("wait", "stall")
            .with_config("timeoutSecs", 1u64)
            .with_config("maxRetries", 0u64),
    );

    let execution = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failure.unwrap().error_kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_failure_stops_unstarted_siblings_in_wave() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut config = test_config();
    config.engine.max_parallel_steps = 2;
    let engine = WorkflowEngine::builder(config)
        .checkpoints(CheckpointManager::in_memory())
        .custom_handler(Arc::new(Boom))
        .custom_handler(Arc::new(Recorder {
            log: log.clone(),
            hold: Duration::from_millis(50),
        }))
        .build()
        .await
        .unwrap();
    let definition = WorkflowDefinition::new("halt", "Halt")
        .with_step(custom("broken", "boom").with_config("maxRetries", 0u64))
        .with_step(custom("running", "recorder"))
        .with_step(custom("unrelated", "recorder"));

    let execution = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failure.as_ref().unwrap().step_id, "broken");
    // Already running when `broken` failed, so it is allowed to finish
    assert_eq!(execution.step_status("running"), Some(StepStatus::Completed));
    assert_eq!(execution.step_status("unrelated"), Some(StepStatus::Skipped));
    assert!(!log.lock().unwrap().contains(&"start:unrelated".to_string()));
    let monitor = engine.monitor();
    let started = monitor.count(&execution.id, TimelineEventType::StepStarted).await;
    assert_eq!(started, 2);
}

#[tokio::test]
async fn test_cancel_interrupts_running_step() {
    let engine = WorkflowEngine::builder(test_config())
        .checkpoints(CheckpointManager::in_memory())
        .custom_handler(Arc::new(Stall))
        .build()
        .await
        .unwrap();
    let definition = WorkflowDefinition::new("stuck", "Stuck")
        .with_step(custom("wait", "stall"))
        .with_step(custom("after", "passthrough").depends_on(["wait"]));

    let running = engine
        .spawn_definition(definition, Configuration::new())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine
            .monitor()
            .count(&running.execution_id, TimelineEventType::StepStarted)
            .await
            == 0
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(engine.cancel(&running.execution_id).await);
    let execution_id = running.execution_id.clone();
    let execution = tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.step_status("wait"), Some(StepStatus::Cancelled));
    assert_eq!(execution.step_status("after"), Some(StepStatus::Cancelled));
    assert_eq!(
        engine.monitor().count(&execution_id, TimelineEventType::ExecutionCancelled).await,
        1
    );
    assert!(!engine.cancel(&execution_id).await);
}

#[tokio::test]
async fn test_pause_holds_between_waves_until_resumed() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::builder(test_config())
        .checkpoints(CheckpointManager::in_memory())
        .custom_handler(Arc::new(Recorder {
            log: log.clone(),
            hold: Duration::from_millis(10),
        }))
        .build()
        .await
        .unwrap();
    let definition = WorkflowDefinition::new("pausable", "Pausable")
        .with_step(custom("first", "recorder"))
        .with_step(custom("second", "recorder").depends_on(["first"]));

    let running = engine
        .spawn_definition(definition, Configuration::new())
        .await
        .unwrap();
    assert!(engine.pause(&running.execution_id).await);
    wait_for_status(&engine, &running.execution_id, ExecutionStatus::Paused).await;

    let seen = log.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.lock().unwrap().len(), seen, "no step starts while paused");

    assert!(engine.resume(&running.execution_id).await);
    let execution_id = running.execution_id.clone();
    let execution = running.wait().await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.step_status("second"), Some(StepStatus::Completed));
    let monitor = engine.monitor();
    assert_eq!(monitor.count(&execution_id, TimelineEventType::ExecutionPaused).await, 1);
    assert_eq!(monitor.count(&execution_id, TimelineEventType::ExecutionResumed).await, 1);
}

#[tokio::test]
async fn test_checkpoint_saved_only_when_execution_completes() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_orders(dir.path());
    let engine = engine(test_config()).await;

    let incremental = |id: &str| {
        WorkflowStep::new(id, StepType::Extract)
            .with_config("connectorType", "filesystem")
            .with_config("path", input.to_string_lossy().to_string())
    };

    // Failing sink: nothing is checkpointed
    let failing = WorkflowDefinition::new("broken-sink", "Broken sink")
        .with_step(incremental("extract"))
        .with_step(
            WorkflowStep::new("load", StepType::Load)
                .with_config("connectorType", "rest")
                .with_config("url", "http://127.0.0.1:9/ingest")
                .with_config("maxRetries", 0u64)
                .depends_on(["extract"]),
        );
    let execution = engine
        .execute_definition(&failing, Configuration::new())
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(engine.checkpoints().cursor("extract").await.unwrap(), None);

    // Completed run advances the cursor; the next run finds nothing new
    let definition = WorkflowDefinition::new("incremental", "Incremental")
        .with_step(incremental("extract"))
        .with_step(load_file("load", &dir.path().join("out.jsonl")).depends_on(["extract"]));
    let first = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(first.output("extract").unwrap().records_processed, 10);
    assert!(engine.checkpoints().cursor("extract").await.unwrap().is_some());

    let second = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(second.output("extract").unwrap().records_processed, 0);
}

#[tokio::test]
async fn test_unknown_workflow_and_empty_definition() {
    let engine = engine(test_config()).await;
    let err = engine.execute("ghost", Configuration::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let definition = WorkflowDefinition::new("empty", "Empty");
    let err = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
