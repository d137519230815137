//! Source checkpoints

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ingestion progress for a single source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub source_id: String,
    /// Opaque cursor; only its ordering matters to the engine
    pub checkpoint_value: String,
    pub processed_at: DateTime<Utc>,
    pub records_processed: u64,
}

impl Checkpoint {
    pub fn new(
        source_id: impl Into<String>,
        checkpoint_value: impl Into<String>,
        records_processed: u64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            checkpoint_value: checkpoint_value.into(),
            processed_at: Utc::now(),
            records_processed,
        }
    }

    /// True when `self` is not behind `previous`.
    pub fn advances(&self, previous: &Checkpoint) -> bool {
        compare_cursors(&self.checkpoint_value, &previous.checkpoint_value) != Ordering::Less
    }
}

/// Order two cursors.
///
/// Numeric cursors compare numerically, RFC 3339 timestamps chronologically,
/// everything else lexicographically.
pub fn compare_cursors(a: &str, b: &str) -> Ordering {
    if let (Ok(x), Ok(y)) = (a.parse::<i128>(), b.parse::<i128>()) {
        return x.cmp(&y);
    }
    if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Ok(x), Ok(y)) = (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        return x.cmp(&y);
    }
    a.cmp(b)
}
