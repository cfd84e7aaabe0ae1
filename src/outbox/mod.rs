//! Transactional outbox.
//!
//! Outbound messages produced by a handler are written to the outbox table in
//! the same local transaction as the aggregate mutation and the idempotency
//! record. A separate [`relay::OutboxRelay`] publishes committed entries to
//! the broker and marks them dispatched only after the broker confirms.
//!
//! Either all of a [`UnitOfWork`] becomes durable or none of it does, so a
//! crash between commit and publish loses nothing and a crash before commit
//! leaves no trace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::ledger::IdempotencyRecord;
use crate::storage::{AggregateMutation, AggregateRef, Result, StorageError};

pub mod relay;

pub use relay::{OutboxRelay, RelayReport};

/// Lifecycle of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Committed, not yet confirmed by the broker.
    Pending,
    /// Broker confirmed the publish.
    Dispatched,
    /// Publishing gave up after the configured number of attempts.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(OutboxStatus::Pending),
            "dispatched" => Ok(OutboxStatus::Dispatched),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(StorageError::Corrupt(format!(
                "unknown outbox status {:?}",
                other
            ))),
        }
    }
}

/// A message awaiting (or done with) publication.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub entry_id: Uuid,
    /// Store-assigned commit order. Zero until staged.
    pub sequence: i64,
    /// Aggregate whose change produced this message. Publication order is
    /// preserved per aggregate.
    pub aggregate: AggregateRef,
    pub routing_key: String,
    /// Id of the encoded envelope, used by downstream consumers for dedup.
    pub message_id: Uuid,
    pub message_type: String,
    /// Encoded [`Envelope`].
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// New pending entry carrying `envelope`.
    pub fn new(aggregate: AggregateRef, routing_key: impl Into<String>, envelope: &Envelope) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            sequence: 0,
            aggregate,
            routing_key: routing_key.into(),
            message_id: envelope.message_id,
            message_type: envelope.message_type.clone(),
            payload: envelope.encode(),
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            dispatched_at: None,
        }
    }
}

/// Everything one successful handler invocation commits.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub record: IdempotencyRecord,
    pub mutation: Option<AggregateMutation>,
    pub entries: Vec<OutboxEntry>,
}

/// Atomic commit of ledger record, aggregate mutation and outbox entries.
#[async_trait]
pub trait TransactionalOutbox: Send + Sync {
    /// Commit `unit` in one transaction.
    ///
    /// The ledger insert happens first: [`StorageError::DuplicateRecord`]
    /// means another worker already committed this message and nothing was
    /// written. [`StorageError::VersionConflict`] means the aggregate moved
    /// since it was loaded; nothing was written either.
    async fn stage(&self, unit: UnitOfWork) -> Result<()>;
}

/// Relay-side access to the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` pending entries in commit order.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Mark a pending entry dispatched. No effect on entries in other states.
    async fn mark_dispatched(&self, entry_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Count a failed publish. With `give_up` the entry moves to
    /// [`OutboxStatus::Failed`] and is no longer returned by `pending`.
    async fn record_failure(&self, entry_id: Uuid, error: &str, give_up: bool) -> Result<()>;

    /// Fetch a single entry.
    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<OutboxEntry>>;

    /// All entries for `aggregate` in commit order, any status.
    async fn entries_for(&self, aggregate: &AggregateRef) -> Result<Vec<OutboxEntry>>;

    /// Aggregates holding at least one [`OutboxStatus::Failed`] entry.
    async fn failed_aggregates(&self) -> Result<Vec<AggregateRef>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Dispatched,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::parse("lost").is_err());
    }

    #[test]
    fn test_new_entry_carries_envelope() {
        let envelope = Envelope::new("WidgetCreated", json!({"widget_id": "w-1"}));
        let entry = OutboxEntry::new(
            AggregateRef::new("widget", "w-1"),
            "widget.created",
            &envelope,
        );

        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.message_id, envelope.message_id);
        assert_eq!(entry.message_type, "WidgetCreated");
        assert_eq!(Envelope::decode(&entry.payload).unwrap(), envelope);
        assert_eq!(entry.attempts, 0);
    }
}
