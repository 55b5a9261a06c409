//! Retention policy for age-based purging.

use crate::model::Timestamp;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Retention policy for determining expired data.
pub trait RetentionPolicy: Send + Sync {
    /// Returns the retention duration.
    fn retention_duration(&self) -> Duration;

    /// Oldest timestamp still retained at `now`.
    fn cutoff(&self, now: Timestamp) -> Timestamp {
        let retention_ms = i64::try_from(self.retention_duration().as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(retention_ms)
    }
}

/// Retention policy with a fixed duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetention(pub Duration);

impl RetentionPolicy for FixedRetention {
    fn retention_duration(&self) -> Duration {
        self.0
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_timestamp_millis() -> Timestamp {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_millis()).unwrap_or(i64::MAX),
        Err(err) => -i64::try_from(err.duration().as_millis()).unwrap_or(i64::MAX),
    }
}
