//! Checkpoint store round-trips against real backends
//!
//! File and SQLite stores live in temporary directories; the cache store
//! is in-process.

mod common;

use std::sync::Arc;
use std::time::Duration;

use flowline_common::types::Checkpoint;
use flowline_engine::checkpoint::{
    create_store, CacheCheckpointStore, CheckpointManager, CheckpointStore, CheckpointStoreType,
    DatabaseCheckpointStore, FileCheckpointStore,
};
use flowline_engine::config::CheckpointConfig;

/// Cursor semantics every store must support
async fn exercise(manager: &CheckpointManager) {
    assert_eq!(manager.latest("orders").await.unwrap(), None);

    assert!(manager.save(&Checkpoint::new("orders", "100", 100)).await.unwrap());
    // Saving the same cursor again is harmless
    assert!(manager.save(&Checkpoint::new("orders", "100", 100)).await.unwrap());
    let latest = manager.latest("orders").await.unwrap().unwrap();
    assert_eq!(latest.checkpoint_value, "100");
    assert_eq!(latest.records_processed, 100);

    // Regressions are ignored
    assert!(!manager.save(&Checkpoint::new("orders", "90", 5)).await.unwrap());
    assert_eq!(manager.cursor("orders").await.unwrap().as_deref(), Some("100"));

    assert!(manager.save(&Checkpoint::new("orders", "250", 150)).await.unwrap());
    assert_eq!(manager.cursor("orders").await.unwrap().as_deref(), Some("250"));

    // Sources are independent
    assert_eq!(manager.cursor("customers").await.unwrap(), None);
}

#[tokio::test]
async fn test_file_store_round_trip_and_reopen() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()).await.unwrap());
    exercise(&CheckpointManager::new(store)).await;

    let reopened = CheckpointManager::new(Arc::new(
        FileCheckpointStore::new(dir.path()).await.unwrap(),
    ));
    assert_eq!(reopened.cursor("orders").await.unwrap().as_deref(), Some("250"));
}

#[tokio::test]
async fn test_cache_store_round_trip() {
    common::init_tracing();
    let store = Arc::new(CacheCheckpointStore::new("test:", None));
    exercise(&CheckpointManager::new(store)).await;
}

#[tokio::test]
async fn test_cache_store_entries_expire() {
    let store = CacheCheckpointStore::new("test:", Some(Duration::from_millis(20)));
    store.set_value("k", "v").await.unwrap();
    assert_eq!(store.get_value("k").await.unwrap().as_deref(), Some("v"));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(store.get_value("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_sqlite_store_round_trip_and_upsert() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("checkpoints.db").display());

    let store = Arc::new(DatabaseCheckpointStore::connect(&url, "checkpoints").await.unwrap());
    exercise(&CheckpointManager::new(store.clone())).await;
    assert_eq!(store.count().await.unwrap(), 1);

    store.set_value("raw", "a").await.unwrap();
    store.set_value("raw", "b").await.unwrap();
    assert_eq!(store.get_value("raw").await.unwrap().as_deref(), Some("b"));
    assert_eq!(store.count().await.unwrap(), 2);

    let reopened = DatabaseCheckpointStore::connect(&url, "checkpoints").await.unwrap();
    let manager = CheckpointManager::new(Arc::new(reopened));
    assert_eq!(manager.cursor("orders").await.unwrap().as_deref(), Some("250"));
}

#[tokio::test]
async fn test_factory_selects_configured_store() {
    let dir = tempfile::tempdir().unwrap();

    let config = CheckpointConfig {
        store_type: "database".into(),
        database_url: Some(format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("factory.db").display()
        )),
        ..CheckpointConfig::default()
    };
    let store = create_store(&config).await.unwrap();
    assert_eq!(store.store_type(), CheckpointStoreType::Database);

    let config = CheckpointConfig {
        store_type: "Cache".into(),
        ..CheckpointConfig::default()
    };
    assert_eq!(create_store(&config).await.unwrap().store_type(), CheckpointStoreType::Cache);

    let config = CheckpointConfig {
        store_type: "carrier-pigeon".into(),
        directory: dir.path().join("fallback"),
        ..CheckpointConfig::default()
    };
    assert_eq!(create_store(&config).await.unwrap().store_type(), CheckpointStoreType::File);
}
