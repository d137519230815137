//! Connector integration tests
//!
//! REST runs against a `wiremock` server; streaming runs against the
//! in-process broker and a broker whose consumers never deliver.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{engine, read_lines, test_config};
use flowline_common::types::{
    Configuration, DataSourceDefinition, ExecutionStatus, StepType, WorkflowDefinition,
    WorkflowStep,
};
use flowline_common::{ErrorKind, Result};
use flowline_engine::config::{HttpConfig, StreamingConfig};
use flowline_engine::connectors::rest::RestConnector;
use flowline_engine::connectors::streaming::{
    InMemoryBroker, Message, MessageBroker, MessageConsumer, StreamingConnector,
};
use flowline_engine::connectors::{records_from_json, Extractor, FetchParams, Loader};
use flowline_engine::WorkflowContext;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rest_source(server: &MockServer) -> DataSourceDefinition {
    DataSourceDefinition::new("orders-api", "rest")
        .with_property("url", format!("{}/orders", server.uri()))
        .with_property("dataPath", "data.items")
        .with_property("checkpointField", "id")
}

fn rest() -> RestConnector {
    RestConnector::new(&HttpConfig::default()).unwrap()
}

#[tokio::test]
async fn test_rest_fetch_extracts_nested_records_and_cursor() {
    common::init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(header("authorization", "Bearer t0k3n"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"items": [{"id": 1}, {"id": 7}, {"id": 3}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = rest_source(&server)
        .with_property("authType", "bearer")
        .with_property("token", "t0k3n");
    let batch = rest().fetch_data(&source, &FetchParams::default()).await.unwrap();

    assert_eq!(batch.records.len(), 3);
    assert_eq!(batch.records[1].get("id"), Some(&json!(7)));
    assert_eq!(batch.cursor.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_rest_fetch_resumes_from_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("since", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"items": [{"id": 8}]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let params = FetchParams {
        since: Some("7".into()),
        ..Default::default()
    };
    let batch = rest().fetch_data(&rest_source(&server), &params).await.unwrap();
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.cursor.as_deref(), Some("8"));
}

#[tokio::test]
async fn test_rest_status_codes_map_to_error_kinds() {
    let server = MockServer::start().await;
    Mock::given(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = rest()
        .fetch_data(&rest_source(&server), &FetchParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.is_retryable());

    let missing = DataSourceDefinition::new("missing", "rest")
        .with_property("url", format!("{}/missing", server.uri()));
    let err = rest()
        .fetch_data(&missing, &FetchParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[tokio::test]
async fn test_rest_load_posts_batches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(body_json(json!([{"id": 1}, {"id": 2}])))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(body_json(json!([{"id": 3}])))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let target = DataSourceDefinition::new("sink", "rest")
        .with_property("url", format!("{}/ingest", server.uri()));
    let mut config = Configuration::new();
    config.insert("batchSize".into(), 2u64.into());
    let records = records_from_json("s", json!([{"id": 1}, {"id": 2}, {"id": 3}]));

    let result = rest()
        .load(&WorkflowContext::standalone("wf"), &records, &config, &target)
        .await
        .unwrap();
    assert_eq!(result.loaded, 3);
    assert_eq!(result.failed, 0);
}

#[tokio::test]
async fn test_rest_to_file_workflow() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"items": [{"id": 1, "total": 5}, {"id": 2, "total": 9}]}
        })))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("orders.jsonl");

    let definition = WorkflowDefinition::new("api-to-file", "API to file")
        .with_step(
            WorkflowStep::new("extract", StepType::Extract)
                .with_config("connectorType", "rest")
                .with_config("url", format!("{}/orders", server.uri()))
                .with_config("dataPath", "data.items")
                .with_config("checkpointField", "id"),
        )
        .with_step(
            WorkflowStep::new("load", StepType::Load)
                .with_config("connectorType", "filesystem")
                .with_config("path", output.to_string_lossy().to_string())
                .depends_on(["extract"]),
        );

    let engine = engine(test_config()).await;
    let execution = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(read_lines(&output).len(), 2);
    assert_eq!(engine.checkpoints().cursor("extract").await.unwrap().as_deref(), Some("2"));
}

/// Broker whose consumers wait for messages that never arrive
#[derive(Default)]
struct SilentBroker {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

struct SilentConsumer {
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageConsumer for SilentConsumer {
    async fn consume(&mut self, cancel: &CancellationToken) -> Result<Option<Message>> {
        cancel.cancelled().await;
        Err(flowline_common::FlowlineError::cancelled("consume cancelled"))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for SilentBroker {
    async fn create_consumer(
        &self,
        _source: &DataSourceDefinition,
    ) -> Result<Box<dyn MessageConsumer>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SilentConsumer {
            closed: self.closed.clone(),
        }))
    }

    async fn produce(
        &self,
        topic: &str,
        _key: Option<&str>,
        _payload: serde_json::Value,
    ) -> Result<Message> {
        Err(flowline_common::FlowlineError::connection(format!(
            "topic '{}' is read-only",
            topic
        )))
    }
}

fn topic_source() -> DataSourceDefinition {
    DataSourceDefinition::new("events", "streaming")
        .with_property("topic", "orders")
        .with_property("groupId", "etl")
}

#[tokio::test]
async fn test_stream_consumer_closed_when_fetch_times_out() {
    let broker = Arc::new(SilentBroker::default());
    let connector = StreamingConnector::new(broker.clone(), StreamingConfig::default());

    let params = FetchParams {
        timeout: Some(Duration::from_millis(30)),
        ..Default::default()
    };
    let batch = connector.fetch_data(&topic_source(), &params).await.unwrap();

    assert!(batch.records.is_empty());
    assert_eq!(broker.opened.load(Ordering::SeqCst), 1);
    assert_eq!(broker.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_consumer_closed_when_cancelled() {
    let broker = Arc::new(SilentBroker::default());
    let connector = StreamingConnector::new(broker.clone(), StreamingConfig::default());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let params = FetchParams::default().with_cancel(cancel);
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        connector.fetch_data(&topic_source(), &params),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(broker.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_workflow_consumes_and_commits() {
    let broker = InMemoryBroker::new(Duration::from_millis(10));
    for i in 0..4 {
        broker
            .produce("orders", Some(i.to_string().as_str()), json!({"id": i}))
            .await
            .unwrap();
    }
    let engine = flowline_engine::WorkflowEngine::builder(test_config())
        .broker(Arc::new(broker.clone()))
        .checkpoints(flowline_engine::checkpoint::CheckpointManager::in_memory())
        .build()
        .await
        .unwrap();

    let definition = WorkflowDefinition::new("stream", "Stream copy")
        .with_step(
            WorkflowStep::new("consume", StepType::Extract)
                .with_config("connectorType", "streaming")
                .with_config("topic", "orders")
                .with_config("groupId", "copy"),
        )
        .with_step(
            WorkflowStep::new("publish", StepType::Load)
                .with_config("connectorType", "streaming")
                .with_config("topic", "orders-copy")
                .with_config("keyField", "id")
                .depends_on(["consume"]),
        );

    let execution = engine
        .execute_definition(&definition, Configuration::new())
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output("consume").unwrap().records_processed, 4);
    assert_eq!(broker.topic_len("orders-copy").await, 4);
    assert_eq!(broker.committed_offset("orders", "copy").await, 4);
    assert_eq!(broker.open_consumers(), 0);
}
