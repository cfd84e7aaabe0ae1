//! Consumer dispatch.
//!
//! Drives one delivery through
//! `decode → idempotency check → handler → commit → ack`, routing failures
//! through the retry policy. The broker acknowledgement always comes after
//! the local commit: a crash in between causes a redelivery that the ledger
//! turns into a no-op, never a lost effect.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{debug, error, field, warn, Span};

use crate::bus::{BusError, Delivery, MessageBroker};
use crate::dlq::{BrokerDeadLetterPublisher, DeadLetter, DeadLetterCause, DeadLetterPublisher};
use crate::envelope::{Envelope, EnvelopeError};
use crate::handlers::{HandlerError, HandlerRegistry, RegistryError};
use crate::ledger::{IdempotencyRecord, Outcome};
use crate::outbox::{OutboxEntry, UnitOfWork};
use crate::retry::{Decision, FailureKind, RetryPolicy};
use crate::storage::{AggregateMutation, StorageError, Store};
use crate::utils::backoff::ledger_write_backoff;

pub mod worker;

pub use worker::{DispatchHandle, DispatchLoop};

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handler ran and its effects were committed.
    Applied,
    /// The message id was already in the ledger; dropped without effect.
    AlreadyProcessed,
    /// Failure was transient; a copy with `attempt` was scheduled after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Routed to the dead-letter destination.
    DeadLettered { cause: DeadLetterCause },
    /// Could not route or record the failure; the broker redelivers it.
    Requeued,
}

/// Why processing a decoded envelope failed.
#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Failure {
    fn kind(&self) -> FailureKind {
        match self {
            Failure::Registry(_) => FailureKind::Permanent,
            Failure::Handler(e) => e.kind(),
            Failure::Storage(e) => e.kind(),
        }
    }

    fn dead_letter_cause(&self) -> DeadLetterCause {
        match self {
            Failure::Registry(_) => DeadLetterCause::UnknownMessageType,
            Failure::Handler(HandlerError::Malformed(_)) => DeadLetterCause::Malformed,
            Failure::Handler(HandlerError::Rejected(_)) => DeadLetterCause::Rejected,
            Failure::Storage(StorageError::Corrupt(_)) => DeadLetterCause::Rejected,
            Failure::Handler(_) | Failure::Storage(_) => DeadLetterCause::RetriesExhausted,
        }
    }
}

/// Runs a handler call, turning a panic into an unclassified failure.
fn guarded<T>(call: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(HandlerError::Unclassified(format!("handler panicked: {}", message)))
    })
}

/// Processes deliveries for one worker.
///
/// Cheap to clone; every worker gets its own copy with its own name.
#[derive(Clone)]
pub struct Dispatcher {
    name: String,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn Store>,
    broker: Arc<dyn MessageBroker>,
    /// Overrides dead-lettering through `broker`.
    dlq: Option<Arc<dyn DeadLetterPublisher>>,
    policy: RetryPolicy,
}

impl Dispatcher {
    /// Dispatcher that dead-letters through `broker`.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn Store>,
        broker: Arc<dyn MessageBroker>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: "dispatcher".to_string(),
            registry,
            store,
            dlq: None,
            broker,
            policy,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dead_letter_publisher(mut self, dlq: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Copy that schedules retries and dead letters through `broker`, the
    /// handle bound to one consumer's channel.
    pub fn with_broker(&self, broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    /// Process one delivery to completion, including the ack or nack.
    ///
    /// Errors only when the delivery could not be settled with the broker;
    /// it will then be redelivered.
    #[tracing::instrument(
        name = "dispatch.process",
        skip_all,
        fields(worker = %self.name, message_id = field::Empty, message_type = field::Empty)
    )]
    pub async fn process(&self, delivery: Delivery) -> Result<Disposition, BusError> {
        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::Malformed(reason)) => {
                warn!(reason = %reason, redelivered = delivery.redelivered, "Undecodable message");
                return self
                    .dead_letter(delivery, None, DeadLetterCause::Malformed, reason)
                    .await;
            }
        };

        let span = Span::current();
        span.record("message_id", field::display(envelope.message_id));
        span.record("message_type", envelope.message_type.as_str());

        match self.store.has_processed(envelope.message_id).await {
            Ok(true) => {
                debug!("Message already processed, dropping");
                delivery.ack().await?;
                return Ok(Disposition::AlreadyProcessed);
            }
            Ok(false) => {}
            Err(e) => return self.fail(delivery, &envelope, Failure::Storage(e)).await,
        }

        match self.apply(&envelope).await {
            Ok(()) => {
                delivery.ack().await?;
                debug!(attempt = envelope.attempt_count, "Message applied");
                Ok(Disposition::Applied)
            }
            Err(Failure::Storage(StorageError::DuplicateRecord { .. })) => {
                debug!("Concurrent delivery committed first, dropping");
                delivery.ack().await?;
                Ok(Disposition::AlreadyProcessed)
            }
            Err(failure) => self.fail(delivery, &envelope, failure).await,
        }
    }

    /// Run the handler and commit its output atomically.
    async fn apply(&self, envelope: &Envelope) -> Result<(), Failure> {
        let handler = self.registry.resolve(&envelope.message_type)?;
        let aggregate = guarded(|| handler.target(envelope))?;
        let current = self.store.load(&aggregate).await?;
        let output = guarded(|| handler.handle(current.as_ref(), envelope))?;

        let mutation = output.state.map(|state| AggregateMutation {
            aggregate: aggregate.clone(),
            expected_version: current.as_ref().map(|record| record.version),
            state,
        });
        let entries = output
            .outbound
            .iter()
            .map(|message| {
                let outbound =
                    Envelope::caused_by(envelope, message.message_type.clone(), message.payload.clone());
                OutboxEntry::new(aggregate.clone(), message.routing_key(), &outbound)
            })
            .collect();

        self.store
            .stage(UnitOfWork {
                record: IdempotencyRecord::new(envelope.message_id, Outcome::Applied),
                mutation,
                entries,
            })
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        delivery: Delivery,
        envelope: &Envelope,
        failure: Failure,
    ) -> Result<Disposition, BusError> {
        let kind = failure.kind();

        match self.policy.decide(envelope.attempt_count, kind) {
            Decision::RetryAfter(delay) => {
                let retry = envelope.next_attempt();
                warn!(
                    error = %failure,
                    attempt = envelope.attempt_count,
                    retry_in_ms = delay.as_millis() as u64,
                    "Transient failure, scheduling retry"
                );

                match self.broker.schedule_retry(retry.encode(), delay).await {
                    Ok(()) => {
                        delivery.ack().await?;
                        Ok(Disposition::RetryScheduled {
                            attempt: retry.attempt_count,
                            delay,
                        })
                    }
                    Err(e) => {
                        warn!(error = %e, "Retry scheduling failed, requeueing");
                        delivery.nack(true).await?;
                        Ok(Disposition::Requeued)
                    }
                }
            }
            Decision::DeadLetter => {
                if kind == FailureKind::Transient {
                    match &failure {
                        Failure::Storage(_) => error!(
                            error = %failure,
                            attempts = envelope.attempt_count,
                            alert = true,
                            "Store unavailable, retry budget exhausted"
                        ),
                        _ => warn!(
                            error = %failure,
                            attempts = envelope.attempt_count,
                            "Retry budget exhausted"
                        ),
                    }
                }
                let cause = failure.dead_letter_cause();
                self.dead_letter(delivery, Some(envelope), cause, failure.to_string())
                    .await
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        envelope: Option<&Envelope>,
        cause: DeadLetterCause,
        reason: String,
    ) -> Result<Disposition, BusError> {
        let dead_letter = match envelope {
            Some(envelope) => {
                DeadLetter::for_envelope(&delivery.body, envelope, cause, reason, &self.name)
            }
            None => DeadLetter::for_body(&delivery.body, cause, reason, &self.name),
        };

        let published = match &self.dlq {
            Some(dlq) => dlq.publish(dead_letter).await,
            None => {
                BrokerDeadLetterPublisher::new(Arc::clone(&self.broker))
                    .publish(dead_letter)
                    .await
            }
        };
        if let Err(e) = published {
            error!(error = %e, cause = %cause, "Dead-letter publish failed, requeueing");
            delivery.nack(true).await?;
            return Ok(Disposition::Requeued);
        }

        if let Some(envelope) = envelope {
            let message_id = envelope.message_id;
            let recorded = (|| async {
                let record = IdempotencyRecord::new(message_id, Outcome::Rejected);
                match self.store.record_processed(record).await {
                    Ok(()) | Err(StorageError::DuplicateRecord { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            })
            .retry(ledger_write_backoff())
            .notify(|err: &StorageError, dur: Duration| {
                warn!(error = %err, delay = ?dur, "Ledger write for rejected message failed, retrying");
            })
            .await;

            // Without a terminal record a later redelivery would run the
            // handler again, so the broker keeps the message.
            if let Err(e) = recorded {
                error!(
                    error = %e,
                    cause = %cause,
                    alert = true,
                    "Dead-lettered message not recorded in ledger, requeueing"
                );
                delivery.nack(true).await?;
                return Ok(Disposition::Requeued);
            }
        }

        delivery.ack().await?;
        Ok(Disposition::DeadLettered { cause })
    }
}
