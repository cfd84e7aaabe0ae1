//! Mock storage implementation for testing.
//!
//! Keeps all three tables behind one lock so `stage` is atomic the same way a
//! database transaction is.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{AggregateRecord, AggregateRef, AggregateStore, Result, StorageError};
use crate::ledger::{IdempotencyLedger, IdempotencyRecord};
use crate::outbox::{OutboxEntry, OutboxStatus, OutboxStore, TransactionalOutbox, UnitOfWork};

#[derive(Default)]
struct Tables {
    ledger: HashMap<Uuid, IdempotencyRecord>,
    aggregates: HashMap<AggregateRef, AggregateRecord>,
    outbox: BTreeMap<i64, OutboxEntry>,
    next_sequence: i64,
}

/// In-memory store.
#[derive(Default)]
pub struct MockStore {
    tables: Mutex<Tables>,
    fail_on_stage: RwLock<bool>,
    fail_on_record: RwLock<bool>,
    concurrent_commit: RwLock<bool>,
    unavailable: RwLock<bool>,
    stage_calls: RwLock<usize>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stage` fail with [`StorageError::Unavailable`] without writing.
    pub async fn set_fail_on_stage(&self, fail: bool) {
        *self.fail_on_stage.write().await = fail;
    }

    /// Make `record_processed` fail with [`StorageError::Unavailable`].
    pub async fn set_fail_on_record(&self, fail: bool) {
        *self.fail_on_record.write().await = fail;
    }

    /// Let another writer commit the next staged message id first, so that
    /// `stage` finds its record already present.
    pub async fn set_concurrent_commit(&self, enabled: bool) {
        *self.concurrent_commit.write().await = enabled;
    }

    /// Make every operation fail with [`StorageError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    /// Number of `stage` calls, successful or not.
    pub async fn stage_calls(&self) -> usize {
        *self.stage_calls.read().await
    }

    /// Number of ledger records.
    pub async fn ledger_len(&self) -> usize {
        self.tables.lock().await.ledger.len()
    }

    /// Every outbox entry in sequence order.
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.tables.lock().await.outbox.values().cloned().collect()
    }

    async fn check_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(StorageError::Unavailable("mock store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for MockStore {
    async fn has_processed(&self, message_id: Uuid) -> Result<bool> {
        self.check_available().await?;
        Ok(self.tables.lock().await.ledger.contains_key(&message_id))
    }

    async fn record_processed(&self, record: IdempotencyRecord) -> Result<()> {
        self.check_available().await?;
        if *self.fail_on_record.read().await {
            return Err(StorageError::Unavailable("simulated ledger write failure".to_string()));
        }
        let mut tables = self.tables.lock().await;
        if tables.ledger.contains_key(&record.message_id) {
            return Err(StorageError::DuplicateRecord {
                message_id: record.message_id,
            });
        }
        tables.ledger.insert(record.message_id, record);
        Ok(())
    }

    async fn get(&self, message_id: Uuid) -> Result<Option<IdempotencyRecord>> {
        self.check_available().await?;
        Ok(self.tables.lock().await.ledger.get(&message_id).cloned())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available().await?;
        let mut tables = self.tables.lock().await;
        let before = tables.ledger.len();
        tables.ledger.retain(|_, record| record.processed_at >= cutoff);
        Ok((before - tables.ledger.len()) as u64)
    }
}

#[async_trait]
impl AggregateStore for MockStore {
    async fn load(&self, aggregate: &AggregateRef) -> Result<Option<AggregateRecord>> {
        self.check_available().await?;
        Ok(self.tables.lock().await.aggregates.get(aggregate).cloned())
    }
}

#[async_trait]
impl TransactionalOutbox for MockStore {
    async fn stage(&self, unit: UnitOfWork) -> Result<()> {
        *self.stage_calls.write().await += 1;
        self.check_available().await?;
        if *self.fail_on_stage.read().await {
            return Err(StorageError::Unavailable("simulated commit failure".to_string()));
        }

        let mut tables = self.tables.lock().await;

        if std::mem::take(&mut *self.concurrent_commit.write().await) {
            let record = IdempotencyRecord::new(unit.record.message_id, unit.record.outcome);
            tables.ledger.insert(record.message_id, record);
        }

        // Validate everything before writing anything.
        if tables.ledger.contains_key(&unit.record.message_id) {
            return Err(StorageError::DuplicateRecord {
                message_id: unit.record.message_id,
            });
        }
        if let Some(mutation) = &unit.mutation {
            let current = tables.aggregates.get(&mutation.aggregate).map(|r| r.version);
            if current != mutation.expected_version {
                return Err(StorageError::VersionConflict {
                    aggregate: mutation.aggregate.clone(),
                    expected: mutation.expected_version,
                });
            }
        }

        let now = Utc::now();
        tables.ledger.insert(unit.record.message_id, unit.record);
        if let Some(mutation) = unit.mutation {
            let version = mutation.next_version();
            tables.aggregates.insert(
                mutation.aggregate.clone(),
                AggregateRecord {
                    aggregate: mutation.aggregate,
                    version,
                    state: mutation.state,
                    updated_at: now,
                },
            );
        }
        for mut entry in unit.entries {
            tables.next_sequence += 1;
            entry.sequence = tables.next_sequence;
            tables.outbox.insert(entry.sequence, entry);
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MockStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.check_available().await?;
        Ok(self
            .tables
            .lock()
            .await
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, entry_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.check_available().await?;
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables
            .outbox
            .values_mut()
            .find(|e| e.entry_id == entry_id && e.status == OutboxStatus::Pending)
        {
            entry.status = OutboxStatus::Dispatched;
            entry.dispatched_at = Some(at);
        }
        Ok(())
    }

    async fn record_failure(&self, entry_id: Uuid, error: &str, give_up: bool) -> Result<()> {
        self.check_available().await?;
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables
            .outbox
            .values_mut()
            .find(|e| e.entry_id == entry_id && e.status == OutboxStatus::Pending)
        {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            if give_up {
                entry.status = OutboxStatus::Failed;
            }
        }
        Ok(())
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<OutboxEntry>> {
        self.check_available().await?;
        Ok(self
            .tables
            .lock()
            .await
            .outbox
            .values()
            .find(|e| e.entry_id == entry_id)
            .cloned())
    }

    async fn entries_for(&self, aggregate: &AggregateRef) -> Result<Vec<OutboxEntry>> {
        self.check_available().await?;
        Ok(self
            .tables
            .lock()
            .await
            .outbox
            .values()
            .filter(|e| &e.aggregate == aggregate)
            .cloned()
            .collect())
    }

    async fn failed_aggregates(&self) -> Result<Vec<AggregateRef>> {
        self.check_available().await?;
        let tables = self.tables.lock().await;
        let mut failed: Vec<AggregateRef> = Vec::new();
        for entry in tables.outbox.values() {
            if entry.status == OutboxStatus::Failed && !failed.contains(&entry.aggregate) {
                failed.push(entry.aggregate.clone());
            }
        }
        Ok(failed)
    }
}
