//! Backoff builders for infrastructure reconnects.
//!
//! Message retries do not use these; they follow the deterministic
//! [`crate::retry::RetryPolicy`]. These cover connecting to the database
//! and the broker, where jitter spreads out reconnect storms, and the one
//! ledger write that follows a dead letter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for connections at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff for re-establishing a consumer after the broker drops it.
///
/// Unbounded attempts: a worker keeps trying until shutdown.
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Backoff for writing the ledger record of a dead-lettered message.
///
/// Short and bounded: the delivery is held while it runs.
pub fn ledger_write_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(200))
        .with_max_times(3)
}
