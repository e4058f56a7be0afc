use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Behavior shared between the publisher and workers: queue naming, retry
/// policy and consumption knobs. Serialization backends are constructed in
/// code and live in the [`SerializationRegistry`](crate::SerializationRegistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Queue used when an invocation carries no queue override.
    pub default_queue: String,

    /// Consumer group shared by cooperating workers.
    pub consumer_group: String,

    /// Total delivery attempts before a transiently failing message is
    /// dead-lettered.
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt.
    pub retry_backoff_base_ms: u64,

    /// Cap on the retry delay.
    pub retry_backoff_max_ms: u64,

    /// How long a delivery may sit unacknowledged before another consumer
    /// may reclaim it.
    pub reclaim_idle_threshold_secs: u64,

    /// How often each worker scans for stale deliveries.
    pub reclaim_interval_secs: u64,

    /// How often each worker refreshes the idle clock on its in-flight
    /// deliveries. Must be shorter than the reclaim idle threshold, or a
    /// long-running handler looks abandoned to its peers.
    pub healthcheck_interval_secs: u64,

    /// Messages fetched per broker read.
    pub read_batch_size: usize,

    /// How long a broker read blocks when the queue is empty.
    pub block_timeout_ms: u64,

    /// Consumer loops per worker process.
    pub concurrency: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            default_queue: "streamq".to_string(),
            consumer_group: "workers".to_string(),
            max_attempts: 3,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            reclaim_idle_threshold_secs: 30,
            reclaim_interval_secs: 10,
            healthcheck_interval_secs: 5,
            read_batch_size: 10,
            block_timeout_ms: 1_000,
            concurrency: 4,
        }
    }
}

impl Configuration {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Configuration = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Exponential backoff before re-enqueueing attempt `attempt + 1`.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .retry_backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.retry_backoff_max_ms))
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn reclaim_idle_threshold(&self) -> Duration {
        Duration::from_secs(self.reclaim_idle_threshold_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn healthcheck_interval(&self) -> Duration {
        Duration::from_secs(self.healthcheck_interval_secs)
    }
}
