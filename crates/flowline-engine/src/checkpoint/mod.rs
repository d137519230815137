//! Checkpoint storage
//!
//! [`CheckpointStore`] is the key-value contract for persisted cursors.
//! Three stores are provided: one file per key, a database table and an
//! in-process cache with optional TTL. [`CheckpointManager`] layers the
//! per-source [`Checkpoint`] record and cursor monotonicity on top.

mod cache;
mod database;
mod file;

use std::sync::Arc;

use async_trait::async_trait;
use flowline_common::types::{compare_cursors, Checkpoint};
use flowline_common::{FlowlineError, Result};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

pub use cache::CacheCheckpointStore;
pub use database::DatabaseCheckpointStore;
pub use file::FileCheckpointStore;

use crate::config::CheckpointConfig;

/// Backing store variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointStoreType {
    File,
    Database,
    Cache,
}

impl CheckpointStoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStoreType::File => "file",
            CheckpointStoreType::Database => "database",
            CheckpointStoreType::Cache => "cache",
        }
    }
}

impl std::str::FromStr for CheckpointStoreType {
    type Err = FlowlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "file" | "filesystem" => Ok(CheckpointStoreType::File),
            "database" | "db" | "sql" => Ok(CheckpointStoreType::Database),
            "cache" | "memory" => Ok(CheckpointStoreType::Cache),
            other => Err(FlowlineError::configuration(format!(
                "unknown checkpoint store type '{}'",
                other
            ))),
        }
    }
}

/// Key-value persistence for checkpoint cursors
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    fn store_type(&self) -> CheckpointStoreType;

    /// Stored value for `key`, or `None` if absent (or expired)
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn set_value(&self, key: &str, value: &str) -> Result<()>;
}

/// Build the store named by `config.store_type`.
///
/// An unrecognized type falls back to the file store with a warning.
pub async fn create_store(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>> {
    let store_type = match config.store_type.parse::<CheckpointStoreType>() {
        Ok(t) => t,
        Err(_) => {
            warn!(
                store_type = %config.store_type,
                fallback = "file",
                "Unrecognized checkpoint store type, falling back to file store"
            );
            CheckpointStoreType::File
        },
    };

    let store: Arc<dyn CheckpointStore> = match store_type {
        CheckpointStoreType::File => Arc::new(FileCheckpointStore::new(&config.directory).await?),
        CheckpointStoreType::Database => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                FlowlineError::configuration(
                    "checkpoint.database_url is required for the database store",
                )
            })?;
            Arc::new(DatabaseCheckpointStore::connect(url, &config.table_name).await?)
        },
        CheckpointStoreType::Cache => Arc::new(CacheCheckpointStore::new(
            config.cache_key_prefix.clone(),
            config.cache_ttl_secs.map(std::time::Duration::from_secs),
        )),
    };

    debug!(store_type = store.store_type().as_str(), "Checkpoint store ready");
    Ok(store)
}

/// Per-source checkpoint bookkeeping on top of a [`CheckpointStore`].
///
/// Saves are serialized so the compare-and-write in [`save`](Self::save)
/// is atomic across clones sharing one manager.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    writes: Arc<Mutex<()>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Manager over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(CacheCheckpointStore::new(String::new(), None)))
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    fn key(source_id: &str) -> String {
        format!("checkpoint:{}", source_id)
    }

    /// Latest checkpoint persisted for `source_id`
    pub async fn latest(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        match self.store.get_value(&Self::key(source_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist `checkpoint` unless it would move the cursor backwards.
    ///
    /// Returns `Ok(false)` when a regressing cursor was ignored.
    #[instrument(skip(self, checkpoint), fields(source_id = %checkpoint.source_id))]
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let _guard = self.writes.lock().await;
        if let Some(previous) = self.latest(&checkpoint.source_id).await? {
            if !checkpoint.advances(&previous) {
                warn!(
                    previous = %previous.checkpoint_value,
                    attempted = %checkpoint.checkpoint_value,
                    "Ignoring checkpoint that would move the cursor backwards"
                );
                return Ok(false);
            }
        }

        let raw = serde_json::to_string(checkpoint)?;
        self.store.set_value(&Self::key(&checkpoint.source_id), &raw).await?;
        debug!(cursor = %checkpoint.checkpoint_value, "Checkpoint saved");
        Ok(true)
    }

    /// Cursor of the latest checkpoint, if any
    pub async fn cursor(&self, source_id: &str) -> Result<Option<String>> {
        Ok(self.latest(source_id).await?.map(|c| c.checkpoint_value))
    }

    /// Pick the greater of two optional cursors
    pub fn max_cursor(current: Option<String>, candidate: &str) -> Option<String> {
        match current {
            Some(c) if compare_cursors(&c, candidate) != std::cmp::Ordering::Less => Some(c),
            _ => Some(candidate.to_string()),
        }
    }
}
