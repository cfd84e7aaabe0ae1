//! Database schema definitions.
//!
//! Table and column identifiers for sea-query statement building, plus the
//! DDL each backend runs at startup. Statements are idempotent and executed
//! one at a time.

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod idens {
    use sea_query::Iden;

    /// Idempotency ledger table schema.
    #[derive(Iden)]
    pub enum Ledger {
        #[iden = "idempotency_ledger"]
        Table,
        #[iden = "message_id"]
        MessageId,
        #[iden = "outcome"]
        Outcome,
        #[iden = "processed_at"]
        ProcessedAt,
    }

    /// Aggregate state table schema.
    #[derive(Iden)]
    pub enum Aggregates {
        #[iden = "aggregates"]
        Table,
        #[iden = "kind"]
        Kind,
        #[iden = "id"]
        Id,
        #[iden = "version"]
        Version,
        #[iden = "state"]
        State,
        #[iden = "updated_at"]
        UpdatedAt,
    }

    /// Outbox table schema.
    #[derive(Iden)]
    pub enum OutboxEntries {
        #[iden = "outbox_entries"]
        Table,
        #[iden = "sequence"]
        Sequence,
        #[iden = "entry_id"]
        EntryId,
        #[iden = "aggregate_kind"]
        AggregateKind,
        #[iden = "aggregate_id"]
        AggregateId,
        #[iden = "routing_key"]
        RoutingKey,
        #[iden = "message_id"]
        MessageId,
        #[iden = "message_type"]
        MessageType,
        #[iden = "payload"]
        Payload,
        #[iden = "status"]
        Status,
        #[iden = "attempts"]
        Attempts,
        #[iden = "last_error"]
        LastError,
        #[iden = "created_at"]
        CreatedAt,
        #[iden = "dispatched_at"]
        DispatchedAt,
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub use idens::*;

/// SQLite DDL.
pub const SQLITE_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS idempotency_ledger (
    message_id TEXT PRIMARY KEY,
    outcome TEXT NOT NULL,
    processed_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_ledger_processed_at ON idempotency_ledger(processed_at)",
    r#"
CREATE TABLE IF NOT EXISTS aggregates (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (kind, id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS outbox_entries (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id TEXT NOT NULL UNIQUE,
    aggregate_kind TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    message_id TEXT NOT NULL,
    message_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    dispatched_at TEXT
)"#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_status_sequence ON outbox_entries(status, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox_entries(aggregate_kind, aggregate_id, sequence)",
];

/// PostgreSQL DDL.
pub const POSTGRES_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS idempotency_ledger (
    message_id TEXT PRIMARY KEY,
    outcome TEXT NOT NULL,
    processed_at TEXT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_ledger_processed_at ON idempotency_ledger(processed_at)",
    r#"
CREATE TABLE IF NOT EXISTS aggregates (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    version BIGINT NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (kind, id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS outbox_entries (
    sequence BIGSERIAL PRIMARY KEY,
    entry_id TEXT NOT NULL UNIQUE,
    aggregate_kind TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    message_id TEXT NOT NULL,
    message_type TEXT NOT NULL,
    payload BYTEA NOT NULL,
    status TEXT NOT NULL,
    attempts BIGINT NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    dispatched_at TEXT
)"#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_status_sequence ON outbox_entries(status, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox_entries(aggregate_kind, aggregate_id, sequence)",
];
