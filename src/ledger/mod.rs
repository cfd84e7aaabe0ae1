//! Idempotency ledger.
//!
//! Records which message ids have already been processed so that a
//! redelivered message is acknowledged without running its handler again.
//! Records are written in the same transaction as the handler's state
//! change (see [`crate::outbox::TransactionalOutbox`]); the standalone
//! [`IdempotencyLedger::record_processed`] is used for outcomes that have no
//! state change, such as dead-lettered messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::{Result, StorageError};
use crate::utils::periodic::{self, PeriodicHandle};

/// How a processed message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler ran and its effects were committed.
    Applied,
    /// Message was rejected and routed to the dead-letter path.
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "applied" => Ok(Outcome::Applied),
            "rejected" => Ok(Outcome::Rejected),
            other => Err(StorageError::Corrupt(format!("unknown outcome {:?}", other))),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry. Unique per `message_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub message_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub outcome: Outcome,
}

impl IdempotencyRecord {
    pub fn new(message_id: Uuid, outcome: Outcome) -> Self {
        Self {
            message_id,
            processed_at: Utc::now(),
            outcome,
        }
    }
}

/// Durable record of processed message ids.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// True if `message_id` has a record.
    async fn has_processed(&self, message_id: Uuid) -> Result<bool>;

    /// Insert a record.
    ///
    /// Fails with [`StorageError::DuplicateRecord`] if the id is already
    /// present, which callers treat as "someone else got there first".
    async fn record_processed(&self, record: IdempotencyRecord) -> Result<()>;

    /// Fetch the record for `message_id`.
    async fn get(&self, message_id: Uuid) -> Result<Option<IdempotencyRecord>>;

    /// Delete records processed before `cutoff`. Returns the number removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Prune records older than `retention` once.
pub async fn prune_expired<L>(ledger: &L, retention: Duration) -> Result<u64>
where
    L: IdempotencyLedger + ?Sized,
{
    let retention = chrono::Duration::from_std(retention)
        .map_err(|e| StorageError::Unavailable(format!("retention window out of range: {}", e)))?;
    let cutoff = Utc::now() - retention;
    let removed = ledger.prune_before(cutoff).await?;
    if removed > 0 {
        info!(removed, cutoff = %cutoff, "Pruned idempotency records");
    } else {
        debug!(cutoff = %cutoff, "No idempotency records to prune");
    }
    Ok(removed)
}

/// Spawn a background task that prunes expired records every `interval`.
pub fn spawn_retention_task<L>(
    ledger: Arc<L>,
    retention: Duration,
    interval: Duration,
) -> PeriodicHandle
where
    L: IdempotencyLedger + ?Sized + 'static,
{
    periodic::spawn("ledger-retention", interval, move || {
        let ledger = Arc::clone(&ledger);
        async move {
            if let Err(e) = prune_expired(ledger.as_ref(), retention).await {
                warn!(error = %e, "Idempotency ledger pruning failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStore;

    #[test]
    fn test_outcome_round_trips_through_text() {
        for outcome in [Outcome::Applied, Outcome::Rejected] {
            assert_eq!(Outcome::parse(outcome.as_str()).unwrap(), outcome);
        }
        assert!(matches!(
            Outcome::parse("maybe"),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_expired_keeps_recent_records() {
        let store = MockStore::new();
        let old = IdempotencyRecord {
            message_id: Uuid::new_v4(),
            processed_at: Utc::now() - chrono::Duration::days(10),
            outcome: Outcome::Applied,
        };
        let recent = IdempotencyRecord::new(Uuid::new_v4(), Outcome::Rejected);
        store.record_processed(old.clone()).await.unwrap();
        store.record_processed(recent.clone()).await.unwrap();

        let removed = prune_expired(&store, Duration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!store.has_processed(old.message_id).await.unwrap());
        assert!(store.has_processed(recent.message_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retention_task_prunes_and_stops() {
        let store = Arc::new(MockStore::new());
        let old = IdempotencyRecord {
            message_id: Uuid::new_v4(),
            processed_at: Utc::now() - chrono::Duration::hours(2),
            outcome: Outcome::Applied,
        };
        store.record_processed(old.clone()).await.unwrap();

        let handle = spawn_retention_task(
            Arc::clone(&store),
            Duration::from_secs(3600),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        assert!(!store.has_processed(old.message_id).await.unwrap());
    }
}
