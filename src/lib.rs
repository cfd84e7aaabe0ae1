//! Conveyor - message-driven command processor
//!
//! Consumes command envelopes from a broker, applies them to aggregates in a
//! relational store exactly once (idempotency ledger), stages outbound
//! messages in a transactional outbox and relays them to the broker with
//! at-least-once delivery.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod envelope;
pub mod handlers;
pub mod ledger;
pub mod outbox;
pub mod retry;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use envelope::{Envelope, EnvelopeError};
pub use retry::{Decision, FailureKind, RetryPolicy};
