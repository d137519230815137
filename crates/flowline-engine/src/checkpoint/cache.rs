//! In-process checkpoint cache with optional TTL

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use flowline_common::Result;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{CheckpointStore, CheckpointStoreType};

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug)]
pub struct CacheCheckpointStore {
    prefix: String,
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheCheckpointStore {
    /// `prefix` namespaces every key; `ttl` of `None` never expires
    pub fn new(prefix: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            prefix: prefix.into(),
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Drop expired entries, returning how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for CacheCheckpointStore {
    fn store_type(&self) -> CheckpointStoreType {
        CheckpointStoreType::Cache
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let key = self.namespaced(key);
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {},
                None => return Ok(None),
            }
        }

        debug!(key = %key, "Checkpoint cache entry expired");
        self.entries.write().await.remove(&key);
        Ok(None)
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().await.insert(self.namespaced(key), entry);
        Ok(())
    }
}
