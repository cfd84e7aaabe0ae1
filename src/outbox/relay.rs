//! Outbox relay.
//!
//! Publishes committed outbox entries in commit order and marks each one
//! dispatched only after the broker confirmed it. A crash between confirm and
//! mark republishes the entry on the next pass; downstream consumers dedupe
//! on `message_id`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{OutboxEntry, OutboxStore};
use crate::bus::{MessageBroker, OutgoingMessage};
use crate::config::OutboxConfig;
use crate::envelope::CONTENT_TYPE;
use crate::storage::{AggregateRef, Result};
use crate::utils::periodic::{self, PeriodicHandle};

/// Outcome of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Entries confirmed by the broker and marked dispatched.
    pub dispatched: usize,
    /// Entries whose publish failed and will be retried.
    pub failed: usize,
    /// Entries that ran out of publish attempts.
    pub given_up: usize,
    /// Entries held back behind an earlier failure of the same aggregate,
    /// including aggregates parked behind a given-up entry.
    pub skipped: usize,
    /// The broker was unavailable and the pass stopped early.
    pub paused: bool,
}

/// Moves pending outbox entries to the broker.
pub struct OutboxRelay<S: OutboxStore + ?Sized> {
    store: Arc<S>,
    broker: Arc<dyn MessageBroker>,
    batch_size: usize,
    max_publish_attempts: u32,
}

impl<S: OutboxStore + ?Sized + 'static> OutboxRelay<S> {
    pub fn new(store: Arc<S>, broker: Arc<dyn MessageBroker>, config: &OutboxConfig) -> Self {
        Self {
            store,
            broker,
            batch_size: config.batch_size.max(1),
            max_publish_attempts: config.max_publish_attempts.max(1),
        }
    }

    /// Run one pass over up to `batch_size` pending entries.
    ///
    /// Entries of one aggregate are published strictly in commit order: once
    /// one fails, the aggregate's later entries wait for the next pass. An
    /// aggregate with a given-up entry stays parked until an operator
    /// resolves that entry.
    #[tracing::instrument(name = "outbox.relay", skip_all)]
    pub async fn relay_once(&self) -> Result<RelayReport> {
        let pending = self.store.pending(self.batch_size).await?;
        let mut report = RelayReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let mut blocked: HashSet<AggregateRef> =
            self.store.failed_aggregates().await?.into_iter().collect();

        for entry in pending {
            if blocked.contains(&entry.aggregate) {
                report.skipped += 1;
                continue;
            }

            match self.broker.publish(outgoing(&entry)).await {
                Ok(()) => {
                    self.store.mark_dispatched(entry.entry_id, Utc::now()).await?;
                    debug!(
                        entry_id = %entry.entry_id,
                        message_id = %entry.message_id,
                        sequence = entry.sequence,
                        "Outbox entry dispatched"
                    );
                    report.dispatched += 1;
                }
                Err(e) if e.is_unavailable() => {
                    warn!(error = %e, "Broker unavailable, pausing outbox relay");
                    report.paused = true;
                    break;
                }
                Err(e) => {
                    let attempts = entry.attempts.saturating_add(1);
                    let give_up = attempts >= self.max_publish_attempts;
                    self.store
                        .record_failure(entry.entry_id, &e.to_string(), give_up)
                        .await?;

                    if give_up {
                        error!(
                            entry_id = %entry.entry_id,
                            message_id = %entry.message_id,
                            aggregate = %entry.aggregate,
                            attempts,
                            error = %e,
                            alert = true,
                            "Outbox entry failed permanently"
                        );
                        report.given_up += 1;
                    } else {
                        warn!(
                            entry_id = %entry.entry_id,
                            aggregate = %entry.aggregate,
                            attempts,
                            error = %e,
                            "Outbox publish failed, will retry"
                        );
                        report.failed += 1;
                    }
                    blocked.insert(entry.aggregate);
                }
            }
        }

        if report.dispatched > 0 || report.failed > 0 || report.given_up > 0 || report.skipped > 0 {
            info!(
                dispatched = report.dispatched,
                failed = report.failed,
                given_up = report.given_up,
                skipped = report.skipped,
                "Outbox relay pass complete"
            );
        }
        Ok(report)
    }
}

fn outgoing(entry: &OutboxEntry) -> OutgoingMessage {
    OutgoingMessage {
        routing_key: entry.routing_key.clone(),
        message_id: entry.message_id,
        message_type: entry.message_type.clone(),
        content_type: CONTENT_TYPE.to_string(),
        body: entry.payload.clone(),
    }
}

/// Spawn a background task that runs a relay pass every `poll_interval`.
pub fn spawn_relay_task<S>(relay: Arc<OutboxRelay<S>>, poll_interval: Duration) -> PeriodicHandle
where
    S: OutboxStore + ?Sized + 'static,
{
    periodic::spawn("outbox-relay", poll_interval, move || {
        let relay = Arc::clone(&relay);
        async move {
            if let Err(e) = relay.relay_once().await {
                error!(error = %e, "Outbox relay pass failed");
            }
        }
    })
}
