//! Step retry policy
//!
//! Engine-wide defaults come from [`RetryConfig`]; a workflow's
//! configuration overrides them and a step's configuration overrides both,
//! using the keys `maxRetries`, `retryDelayMs`, `backoffMultiplier`,
//! `maxRetryDelayMs` and `timeoutSecs`.

use std::time::Duration;

use flowline_common::types::{Configuration, ConfigurationExt};
use flowline_common::FlowlineError;

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Engine defaults, then workflow overrides, then step overrides
    pub fn resolve(config: &RetryConfig, workflow: &Configuration, step: &Configuration) -> Self {
        Self::from(config).with_overrides(workflow).with_overrides(step)
    }

    pub fn with_overrides(mut self, overrides: &Configuration) -> Self {
        if let Some(n) = overrides.get_u64("maxRetries") {
            self.max_retries = n.min(u32::MAX as u64) as u32;
        }
        if let Some(ms) = overrides.get_u64("retryDelayMs") {
            self.initial_delay = Duration::from_millis(ms);
        }
        if let Some(m) = overrides.get_f64("backoffMultiplier").filter(|m| *m >= 1.0) {
            self.backoff_multiplier = m;
        }
        if let Some(ms) = overrides.get_u64("maxRetryDelayMs") {
            self.max_delay = Duration::from_millis(ms);
        }
        self
    }

    /// Whether a failure on 0-based `attempt` earns another attempt
    pub fn should_retry(&self, error: &FlowlineError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Wait before the retry following 0-based `attempt`:
    /// `initial * multiplier^attempt`, capped at `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = base * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            Duration::ZERO
        }
    }
}

/// Per-step deadline: `timeoutSecs` from the step, then the workflow,
/// then the engine default
pub fn step_timeout(default: Duration, workflow: &Configuration, step: &Configuration) -> Duration {
    step.get_u64("timeoutSecs")
        .or_else(|| workflow.get_u64("timeoutSecs"))
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(default)
}
