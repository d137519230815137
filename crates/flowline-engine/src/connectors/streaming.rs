//! Streaming source and sink over a pluggable message broker
//!
//! The connector only talks to [`MessageBroker`] / [`MessageConsumer`];
//! [`InMemoryBroker`] is the in-process implementation. A real client
//! (Kafka, Event Hubs) plugs in behind the same traits.
//!
//! Connection properties: `topic` (required), `groupId` (default
//! `flowline`), `bootstrapServers` (passed through to the broker).
//!
//! Consumer lifecycle: every fetch creates a consumer, consumes until the
//! batch is full, the deadline passes or the first poll comes back empty,
//! then closes the consumer and commits. A cancelled or failed fetch
//! returns the error and abandons the consumer instead, so the messages
//! it had already read are delivered again on the next fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_common::types::{Configuration, ConfigurationExt, DataRecord, DataSourceDefinition};
use flowline_common::{ErrorKind, FlowlineError, Result};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{require_property, Batch, ConnectorType, Extractor, FetchParams, LoadResult, Loader};
use crate::config::StreamingConfig;
use crate::context::WorkflowContext;

/// Consumer group used when a source does not name one
pub const DEFAULT_GROUP_ID: &str = "flowline";

/// Roughly thirty years; stands in for deadlines too large to represent
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// A message read from or written to a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Record carrying the payload, with broker coordinates as metadata
    pub fn into_record(self, source_id: &str) -> DataRecord {
        let mut record = DataRecord::from_json(source_id, self.payload);
        record.metadata.insert("topic".into(), self.topic);
        record
            .metadata
            .insert("partition".into(), self.partition.to_string());
        record.metadata.insert("offset".into(), self.offset.to_string());
        if let Some(key) = self.key {
            record.metadata.insert("key".into(), key);
        }
        record
    }
}

/// Handle on an open subscription
#[async_trait]
pub trait MessageConsumer: Send {
    /// Next message, `None` when nothing arrived within one poll interval.
    /// Fails with a cancellation error once `cancel` fires.
    async fn consume(&mut self, cancel: &CancellationToken) -> Result<Option<Message>>;

    /// Commit progress and release the subscription. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Release the subscription without committing what was consumed, so
    /// the messages are redelivered. Brokers without that notion close.
    async fn abandon(&mut self) -> Result<()> {
        self.close().await
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn create_consumer(
        &self,
        source: &DataSourceDefinition,
    ) -> Result<Box<dyn MessageConsumer>>;

    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<Message>;
}

#[derive(Default)]
struct BrokerState {
    topics: Mutex<HashMap<String, Vec<Message>>>,
    /// Committed next-offset per (topic, group)
    offsets: Mutex<HashMap<(String, String), usize>>,
    published: Notify,
    open_consumers: AtomicUsize,
}

/// Single-partition, in-process broker with per-group committed offsets
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
    poll_interval: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(StreamingConfig::default().poll_interval())
    }
}

impl InMemoryBroker {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(BrokerState::default()),
            poll_interval,
        }
    }

    /// Consumers created and not yet closed or dropped
    pub fn open_consumers(&self) -> usize {
        self.state.open_consumers.load(Ordering::SeqCst)
    }

    /// Next offset the group will read from `topic`
    pub async fn committed_offset(&self, topic: &str, group: &str) -> usize {
        self.state
            .offsets
            .lock()
            .await
            .get(&(topic.to_string(), group.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub async fn topic_len(&self, topic: &str) -> usize {
        self.state
            .topics
            .lock()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn create_consumer(
        &self,
        source: &DataSourceDefinition,
    ) -> Result<Box<dyn MessageConsumer>> {
        let topic = require_property(source, "topic")?.to_string();
        let group = source
            .property("groupId")
            .unwrap_or(DEFAULT_GROUP_ID)
            .to_string();
        let position = self.committed_offset(&topic, &group).await;
        self.state.open_consumers.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %topic, group = %group, position, "Consumer created");

        Ok(Box::new(InMemoryConsumer {
            state: Arc::clone(&self.state),
            topic,
            group,
            position,
            poll_interval: self.poll_interval,
            released: false,
        }))
    }

    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<Message> {
        let message = {
            let mut topics = self.state.topics.lock().await;
            let log = topics.entry(topic.to_string()).or_default();
            let message = Message {
                topic: topic.to_string(),
                partition: 0,
                offset: log.len() as i64,
                key: key.map(str::to_string),
                payload,
                timestamp: Utc::now(),
            };
            log.push(message.clone());
            message
        };
        self.state.published.notify_waiters();
        Ok(message)
    }
}

struct InMemoryConsumer {
    state: Arc<BrokerState>,
    topic: String,
    group: String,
    position: usize,
    poll_interval: Duration,
    released: bool,
}

impl InMemoryConsumer {
    async fn next_message(&self) -> Option<Message> {
        self.state
            .topics
            .lock()
            .await
            .get(&self.topic)
            .and_then(|log| log.get(self.position).cloned())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.state.open_consumers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    async fn consume(&mut self, cancel: &CancellationToken) -> Result<Option<Message>> {
        if self.released {
            return Err(FlowlineError::execution("consumer is closed"));
        }
        if cancel.is_cancelled() {
            return Err(FlowlineError::cancelled("consume cancelled"));
        }

        // Register for wakeups before looking, so a publish in between is not missed
        let state = Arc::clone(&self.state);
        let published = state.published.notified();
        if let Some(message) = self.next_message().await {
            self.position += 1;
            return Ok(Some(message));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(FlowlineError::cancelled("consume cancelled")),
            _ = published => {},
            _ = tokio::time::sleep(self.poll_interval) => {},
        }

        let message = self.next_message().await;
        if message.is_some() {
            self.position += 1;
        }
        Ok(message)
    }

    async fn abandon(&mut self) -> Result<()> {
        if !self.released {
            debug!(topic = %self.topic, group = %self.group, "Consumer abandoned");
            self.release();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.state
            .offsets
            .lock()
            .await
            .insert((self.topic.clone(), self.group.clone()), self.position);
        debug!(
            topic = %self.topic,
            group = %self.group,
            offset = self.position,
            "Consumer closed"
        );
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        // Dropped without close: the subscription is released, progress is not committed
        self.release();
    }
}

/// `now + timeout`, saturating far in the future instead of overflowing
fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

/// Extractor/loader over a [`MessageBroker`]
#[derive(Clone)]
pub struct StreamingConnector {
    broker: Arc<dyn MessageBroker>,
    config: StreamingConfig,
}

impl StreamingConnector {
    pub fn new(broker: Arc<dyn MessageBroker>, config: StreamingConfig) -> Self {
        Self { broker, config }
    }

    async fn collect(
        &self,
        consumer: &mut dyn MessageConsumer,
        source: &DataSourceDefinition,
        params: &FetchParams,
    ) -> Result<Batch> {
        let wait = params.timeout.unwrap_or_else(|| self.config.fetch_timeout());
        let deadline = deadline_after(wait);
        let max = params.max_records.unwrap_or(self.config.max_batch_size);
        let cancel = params.cancel.clone().unwrap_or_default();
        let since: Option<i64> = params.since.as_deref().and_then(|s| s.parse().ok());

        let mut batch = Batch::default();
        while batch.records.len() < max {
            let message = match tokio::time::timeout_at(deadline, consumer.consume(&cancel)).await {
                Err(_) => {
                    debug!("Fetch deadline reached");
                    break;
                },
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    if e.kind() == ErrorKind::Cancelled {
                        debug!(discarded = batch.records.len(), "Fetch cancelled");
                    }
                    return Err(e);
                },
            };
            if since.is_some_and(|since| message.offset <= since) {
                continue;
            }
            batch.cursor = Some(message.offset.to_string());
            batch.records.push(message.into_record(&source.id));
        }
        Ok(batch)
    }
}

#[async_trait]
impl Extractor for StreamingConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Streaming
    }

    async fn validate_connection(&self, source: &DataSourceDefinition) -> Result<bool> {
        let mut consumer = self.broker.create_consumer(source).await?;
        consumer.close().await?;
        Ok(true)
    }

    #[instrument(skip(self, source, params), fields(source_id = %source.id))]
    async fn fetch_data(
        &self,
        source: &DataSourceDefinition,
        params: &FetchParams,
    ) -> Result<Batch> {
        let mut consumer = self.broker.create_consumer(source).await?;
        let outcome = self.collect(consumer.as_mut(), source, params).await;
        let closed = match &outcome {
            Ok(_) => consumer.close().await,
            Err(_) => consumer.abandon().await,
        };

        let batch = outcome?;
        if let Err(e) = closed {
            warn!(error = %e, "Failed to close consumer");
            return Err(e);
        }
        info!(records = batch.records.len(), cursor = ?batch.cursor, "Fetched stream batch");
        Ok(batch)
    }

    fn stream_data<'a>(
        &'a self,
        source: &'a DataSourceDefinition,
        cancel: CancellationToken,
    ) -> BoxStream<'a, Result<DataRecord>> {
        struct State {
            consumer: Option<Box<dyn MessageConsumer>>,
            done: bool,
        }

        let initial = State {
            consumer: None,
            done: false,
        };
        stream::unfold(initial, move |mut state| {
            let cancel = cancel.clone();
            async move {
                if state.done {
                    return None;
                }
                let mut consumer = match state.consumer.take() {
                    Some(consumer) => consumer,
                    None => match self.broker.create_consumer(source).await {
                        Ok(consumer) => consumer,
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e), state));
                        },
                    },
                };
                loop {
                    match consumer.consume(&cancel).await {
                        Ok(Some(message)) => {
                            state.consumer = Some(consumer);
                            return Some((Ok(message.into_record(&source.id)), state));
                        },
                        Ok(None) => continue,
                        Err(e) => {
                            if let Err(close_err) = consumer.close().await {
                                warn!(error = %close_err, "Failed to close consumer");
                            }
                            if e.kind() == ErrorKind::Cancelled {
                                return None;
                            }
                            state.done = true;
                            return Some((Err(e), state));
                        },
                    }
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl Loader for StreamingConnector {
    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Streaming
    }

    #[instrument(
        skip(self, ctx, records, config, target),
        fields(target_id = %target.id, records = records.len())
    )]
    async fn load(
        &self,
        ctx: &WorkflowContext,
        records: &[DataRecord],
        config: &Configuration,
        target: &DataSourceDefinition,
    ) -> Result<LoadResult> {
        let topic = require_property(target, "topic")?;
        let key_field = config.get_str("keyField");

        let mut result = LoadResult::default();
        for record in records {
            if ctx.is_cancelled() {
                return Err(FlowlineError::cancelled(format!(
                    "produce to '{}' cancelled",
                    topic
                )));
            }
            let key = key_field
                .and_then(|f| record.get(f))
                .map(crate::transform::plain_string);
            self.broker
                .produce(topic, key.as_deref(), record.to_json())
                .await?;
            result.loaded += 1;
        }
        Ok(result)
    }
}
