//! Shared helpers for engine integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use flowline_common::types::{StepType, WorkflowStep};
use flowline_engine::checkpoint::CheckpointManager;
use flowline_engine::{EngineConfig, WorkflowEngine};
use serde_json::json;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; `RUST_LOG` filters it
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Engine defaults with fast retries
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

/// Engine with an in-memory checkpoint store
pub async fn engine(config: EngineConfig) -> WorkflowEngine {
    init_tracing();
    WorkflowEngine::builder(config)
        .checkpoints(CheckpointManager::in_memory())
        .build()
        .await
        .expect("engine builds")
}

/// Ten orders, four of them active, alternating US and EU
pub fn write_orders(dir: &Path) -> PathBuf {
    let orders: Vec<_> = (0..10)
        .map(|i| {
            json!({
                "id": i,
                "status": if i % 3 == 0 { "active" } else { "closed" },
                "region": if i % 2 == 0 { "US" } else { "EU" },
                "amount": i * 10,
            })
        })
        .collect();
    let path = dir.join("orders.json");
    std::fs::write(&path, serde_json::to_vec(&orders).expect("serializes")).expect("writes");
    path
}

pub fn extract_file(id: &str, path: &Path) -> WorkflowStep {
    WorkflowStep::new(id, StepType::Extract)
        .with_config("connectorType", "filesystem")
        .with_config("path", path.to_string_lossy().to_string())
        .with_config("incremental", false)
}

pub fn load_file(id: &str, path: &Path) -> WorkflowStep {
    WorkflowStep::new(id, StepType::Load)
        .with_config("connectorType", "filesystem")
        .with_config("path", path.to_string_lossy().to_string())
}

/// Lines of a JSON-lines file
pub fn read_lines(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .expect("output exists")
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("valid JSON line"))
        .collect()
}
