//! Dispatch, retry, ledger and outbox tuning.

use std::time::Duration;

use serde::Deserialize;

/// Dispatch loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of consumer workers. Default: 4.
    pub workers: usize,
    /// Failed attempts allowed before a message is dead-lettered. Default: 10.
    pub max_retry_attempts: u32,
    /// First retry delay in milliseconds. Default: 100.
    pub backoff_base_ms: u64,
    /// Maximum retry delay in milliseconds. Default: 30000.
    pub backoff_cap_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retry_attempts: 10,
            backoff_base_ms: 100,
            backoff_cap_ms: 30_000,
        }
    }
}

/// Idempotency ledger retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long processed message ids are remembered. Default: 7 days.
    ///
    /// A redelivery older than this window is processed again.
    pub retention_window_secs: u64,
    /// How often expired records are pruned. Default: 1 hour.
    pub prune_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_window_secs: 7 * 24 * 60 * 60,
            prune_interval_secs: 60 * 60,
        }
    }
}

impl LedgerConfig {
    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_window_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Outbox relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Interval between relay passes in milliseconds. Default: 500.
    pub relay_poll_interval_ms: u64,
    /// Pending entries fetched per pass. Default: 100.
    pub batch_size: usize,
    /// Rejected publishes before an entry is marked failed. Default: 10.
    pub max_publish_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            relay_poll_interval_ms: 500,
            batch_size: 100,
            max_publish_attempts: 10,
        }
    }
}

impl OutboxConfig {
    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_interval_ms)
    }
}
