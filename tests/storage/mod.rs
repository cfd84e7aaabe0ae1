//! Shared storage integration tests.
//!
//! Tests the IdempotencyLedger, AggregateStore, TransactionalOutbox and
//! OutboxStore interfaces against all implementations. Each backend test
//! binary imports these functions and runs them through the `run_*` macros.
//!
//! Tests use fresh ids, so they can run against a shared database.

pub mod ledger_tests;
pub mod outbox_tests;
pub mod unit_of_work_tests;
