//! Retry & backoff policy for failed deliveries.
//!
//! The dispatcher asks the policy what to do with a failed message instead of
//! retrying inline, so decisions can be tested without a broker.

use std::time::Duration;

use crate::config::ProcessingConfig;

/// Failure classification, supplied by the component that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retrying may succeed (temporary unavailability, conflicts).
    Transient,
    /// Retrying will never succeed (malformed input, business rejection).
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// What to do with a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Redeliver after the given delay.
    RetryAfter(Duration),
    /// Route to the dead-letter path.
    DeadLetter,
}

/// Exponential backoff with a cap and a maximum attempt count.
///
/// Deterministic: the same inputs always produce the same decision.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Failed attempts allowed before dead-lettering.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl From<&ProcessingConfig> for RetryPolicy {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_cap_ms),
            max_attempts: config.max_retry_attempts,
        }
    }
}

impl RetryPolicy {
    /// Decide the fate of a message that failed on attempt `attempt_count`
    /// (0 for the first delivery).
    pub fn decide(&self, attempt_count: u32, kind: FailureKind) -> Decision {
        match kind {
            FailureKind::Permanent => Decision::DeadLetter,
            FailureKind::Transient if attempt_count >= self.max_attempts => Decision::DeadLetter,
            FailureKind::Transient => Decision::RetryAfter(self.delay_for_attempt(attempt_count)),
        }
    }

    /// Delay = base * 2^attempt, capped at max_delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(32));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped_ms)
    }
}
