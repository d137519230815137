//! Per-execution context
//!
//! Steps never share mutable state directly. Everything a step wants to
//! hand to a later step (lineage entity ids, branch decisions, arbitrary
//! metadata) goes through the [`ContextStore`] owned by the execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use flowline_common::types::{ConfigValue, Configuration};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const ENTITY_KEY_PREFIX: &str = "lineage.entity.";

/// Synchronized key-value store scoped to one execution
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.insert(key.into(), value);
    }

    pub async fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.write().await.remove(key)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.inner.read().await.clone()
    }
}

/// Execution-scoped context handed to every step processor
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub execution_id: String,
    pub source_id: Option<String>,
    pub parameters: Configuration,
    store: ContextStore,
    cancel: CancellationToken,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
        parameters: Configuration,
        cancel: CancellationToken,
    ) -> Self {
        let source_id = parameters
            .get("sourceId")
            .and_then(ConfigValue::as_str)
            .map(str::to_string);
        Self {
            workflow_id: workflow_id.into(),
            execution_id: execution_id.into(),
            source_id,
            parameters,
            store: ContextStore::new(),
            cancel,
        }
    }

    /// Context detached from any engine, for exercising processors directly
    pub fn standalone(workflow_id: impl Into<String>) -> Self {
        Self::new(
            workflow_id,
            uuid::Uuid::new_v4().to_string(),
            Configuration::new(),
            CancellationToken::new(),
        )
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.store.get(key).await
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.store.set(key, value).await;
    }

    /// Record the lineage entity produced by `step_id`
    pub async fn set_entity_id(&self, step_id: &str, entity_id: &str) {
        self.store
            .set(
                format!("{}{}", ENTITY_KEY_PREFIX, step_id),
                serde_json::Value::String(entity_id.to_string()),
            )
            .await;
    }

    /// Lineage entity produced by `step_id`, if it recorded one
    pub async fn entity_id(&self, step_id: &str) -> Option<String> {
        self.store
            .get(&format!("{}{}", ENTITY_KEY_PREFIX, step_id))
            .await
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Resolve a named value from execution parameters, then metadata
    pub async fn lookup(&self, name: &str) -> Option<serde_json::Value> {
        if let Some(value) = self.parameters.get(name) {
            return Some(value.to_json());
        }
        self.store.get(name).await
    }
}
