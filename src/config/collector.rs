//! Configuration for the bounded fan-out collector.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Worker pool sizing and per-entity fetch policy.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CollectorConfig {
    /// Maximum number of entities fetched concurrently.
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Collector concurrency must be between 1 and 1024"
    ))]
    pub concurrency: usize,

    /// Deadline for one entity's detail + metrics pair, in milliseconds.
    /// `0` disables the deadline.
    pub fetch_timeout_ms: u64,

    /// Render the collection as JSON instead of a listing.
    pub raw: bool,

    /// Additional attempts for calls that fail transiently. `0` disables retries.
    #[validate(range(max = 10, message = "At most 10 retry attempts are allowed"))]
    pub retry_attempts: u32,

    /// Base delay between retry attempts, in milliseconds. Grows linearly.
    #[validate(range(max = 60000, message = "Retry delay must not exceed 60000 ms"))]
    pub retry_delay_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            fetch_timeout_ms: 0,
            raw: false,
            retry_attempts: 0,
            retry_delay_ms: 100,
        }
    }
}

impl CollectorConfig {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_ms > 0).then(|| Duration::from_millis(self.fetch_timeout_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
