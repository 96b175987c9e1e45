//! Configuration for the streaming distribution command.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Bridge channel sizing, grouping key, and polling rate.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DistributionConfig {
    /// Capacity of the in-memory channel between the dump and the reducer, in bytes.
    #[validate(range(min = 1, message = "Bridge buffer size must be at least 1 byte"))]
    pub buffer_size: usize,

    /// Dotted path of the field records are grouped by, e.g. `detail.state`.
    #[validate(length(min = 1, message = "Grouping field must not be empty"))]
    pub group_by: String,

    /// Seconds between repeated runs. `0` runs once and exits.
    pub rate_secs: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            group_by: "detail.state".to_string(),
            rate_secs: 0,
        }
    }
}

impl DistributionConfig {
    /// Polling interval, if the command should repeat.
    pub fn rate(&self) -> Option<Duration> {
        (self.rate_secs > 0).then(|| Duration::from_secs(self.rate_secs))
    }
}
