//! Persistence for aggregate state, the idempotency ledger and the outbox.
//!
//! The three live in the same database so a single local transaction can
//! cover all of them (see [`TransactionalOutbox`]).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{StorageConfig, StorageType};
use crate::ledger::IdempotencyLedger;
use crate::outbox::{OutboxStore, TransactionalOutbox};
use crate::retry::FailureKind;

pub mod mock;
pub mod schema;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod sql;

pub use mock::MockStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Message {message_id} already recorded in idempotency ledger")]
    DuplicateRecord { message_id: Uuid },

    #[error("Version conflict on {aggregate}: expected version {expected:?}")]
    VersionConflict {
        aggregate: AggregateRef,
        expected: Option<i64>,
    },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Retry classification.
    ///
    /// Conflicts and connectivity problems clear up on their own. A row the
    /// store cannot read back will not.
    pub fn kind(&self) -> FailureKind {
        match self {
            StorageError::Corrupt(_) => FailureKind::Permanent,
            _ => FailureKind::Transient,
        }
    }
}

/// Identifies the aggregate a command targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateRef {
    pub kind: String,
    pub id: String,
}

impl AggregateRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Persisted state of one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub aggregate: AggregateRef,
    /// Incremented on every committed mutation, starting at 1.
    pub version: i64,
    pub state: Value,
    pub updated_at: DateTime<Utc>,
}

/// State change applied inside a unit of work.
///
/// `expected_version` is the version the handler read: `None` creates the
/// aggregate, `Some(v)` updates it only if it is still at `v`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateMutation {
    pub aggregate: AggregateRef,
    pub expected_version: Option<i64>,
    pub state: Value,
}

impl AggregateMutation {
    /// Version the aggregate will have once the mutation commits.
    pub fn next_version(&self) -> i64 {
        self.expected_version.map_or(1, |v| v + 1)
    }
}

/// Read access to aggregate state.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Load the current state, or `None` if the aggregate does not exist.
    async fn load(&self, aggregate: &AggregateRef) -> Result<Option<AggregateRecord>>;
}

/// Everything the dispatch path needs from one database.
pub trait Store: IdempotencyLedger + AggregateStore + OutboxStore + TransactionalOutbox {}

impl<T> Store for T where
    T: IdempotencyLedger + AggregateStore + OutboxStore + TransactionalOutbox + ?Sized
{
}

/// Canonical text form for stored timestamps.
///
/// Fixed width and always UTC so that string comparison orders correctly.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

/// Parse a stored UUID column.
pub fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Corrupt(format!("bad uuid {:?}: {}", raw, e)))
}

/// Initialize storage based on configuration.
///
/// Creates the schema if it does not exist yet.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn Store>> {
    match config.storage_type {
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            info!(path = %config.sqlite.path, "Storage: sqlite");

            if let Some(parent) = std::path::Path::new(&config.sqlite.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StorageError::Unavailable(e.to_string()))?;
                }
            }

            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(config.sqlite.max_connections)
                .connect(&format!("sqlite:{}?mode=rwc", config.sqlite.path))
                .await?;

            let store = sql::sqlite::SqliteStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            info!("Storage: postgres");

            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.postgres.max_connections)
                .connect(&config.postgres.uri)
                .await?;

            let store = sql::postgres::PostgresStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[allow(unreachable_patterns)]
        other => {
            error!(storage_type = %other, "Storage backend not compiled in");
            Err(StorageError::Unavailable(format!(
                "storage type '{}' requires the '{}' feature",
                other, other
            )))
        }
    }
}
