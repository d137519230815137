//! Engine configuration
//!
//! Layered the usual way: built-in defaults, then an optional file
//! (TOML, JSON or YAML), then `FLOWLINE__SECTION__KEY` environment
//! variables. A `.env` file is honored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ============================================================================
// Defaults
// ============================================================================

/// Default number of mutually independent steps run at once (sequential).
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 1;

/// Default per-step deadline in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default retry count for retryable step failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry in milliseconds.
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;

/// Default exponential backoff multiplier.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default ceiling for a single retry delay in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default number of timeline entries kept in memory.
pub const DEFAULT_TIMELINE_CAPACITY: usize = 1_000;

/// Default checkpoint store type.
pub const DEFAULT_CHECKPOINT_STORE: &str = "file";

/// Default checkpoint directory for the file store.
pub const DEFAULT_CHECKPOINT_DIR: &str = "./data/checkpoints";

/// Default key prefix for the cache store.
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "flowline:";

/// Default HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default HTTP user agent.
pub const DEFAULT_USER_AGENT: &str = concat!("flowline/", env!("CARGO_PKG_VERSION"));

/// Default deadline for a bounded streaming fetch in seconds.
pub const DEFAULT_STREAM_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default maximum records per streaming fetch.
pub const DEFAULT_STREAM_MAX_BATCH: usize = 1_000;

/// Default broker poll interval in milliseconds.
pub const DEFAULT_STREAM_POLL_INTERVAL_MS: u64 = 200;

/// Environment prefix for overrides (`FLOWLINE__RETRY__MAX_RETRIES=5`)
pub const ENV_PREFIX: &str = "FLOWLINE";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: SchedulerConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub checkpoint: CheckpointConfig,
    pub http: HttpConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_parallel_steps: usize,
    pub step_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub timeline_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeline_capacity: DEFAULT_TIMELINE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// "file", "database" or "cache"; anything else falls back to "file"
    pub store_type: String,
    pub directory: PathBuf,
    pub database_url: Option<String>,
    pub table_name: String,
    pub cache_ttl_secs: Option<u64>,
    pub cache_key_prefix: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            store_type: DEFAULT_CHECKPOINT_STORE.to_string(),
            directory: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            database_url: None,
            table_name: "flowline_checkpoints".to_string(),
            cache_ttl_secs: None,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub fetch_timeout_secs: u64,
    pub max_batch_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: DEFAULT_STREAM_FETCH_TIMEOUT_SECS,
            max_batch_size: DEFAULT_STREAM_MAX_BATCH,
            poll_interval_ms: DEFAULT_STREAM_POLL_INTERVAL_MS,
        }
    }
}

impl StreamingConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("flowline").required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .context("Failed to read engine configuration")?
            .try_deserialize()
            .context("Invalid engine configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engine.max_parallel_steps == 0 {
            anyhow::bail!("engine.max_parallel_steps must be greater than 0");
        }

        if self.monitor.timeline_capacity == 0 {
            anyhow::bail!("monitor.timeline_capacity must be greater than 0");
        }

        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "retry.backoff_multiplier must be at least 1.0 (got {})",
                self.retry.backoff_multiplier
            );
        }

        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            tracing::warn!(
                initial_delay_ms = self.retry.initial_delay_ms,
                max_delay_ms = self.retry.max_delay_ms,
                "retry.max_delay_ms is below the initial delay; every retry will wait max_delay_ms"
            );
        }

        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.step_timeout_secs)
    }
}
