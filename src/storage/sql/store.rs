//! Unified SQL store implementation.
//!
//! Uses a macro to generate implementations for each SQL backend,
//! eliminating code duplication while maintaining type safety.

use std::marker::PhantomData;

use super::SqlDatabase;

/// SQL-based implementation of every storage trait.
///
/// Works with any SQL database that implements the `SqlDatabase` trait
/// (PostgreSQL, SQLite). All three tables share one pool so a unit of work
/// commits in a single transaction. Each backend module opens that
/// transaction its own way.
pub struct SqlStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlStore<DB> {
    /// Create a new SQL store with the given pool.
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &DB::Pool {
        &self.pool
    }
}

/// Log how a unit of work ended.
pub(super) fn log_unit(
    unit: &crate::outbox::UnitOfWork,
    result: &crate::storage::Result<()>,
) {
    match result {
        Ok(()) => tracing::debug!(
            message_id = %unit.record.message_id,
            outcome = %unit.record.outcome,
            entries = unit.entries.len(),
            "Unit of work committed"
        ),
        Err(e) => tracing::debug!(
            message_id = %unit.record.message_id,
            error = %e,
            "Unit of work rolled back"
        ),
    }
}

/// Macro to implement the storage traits for a specific SQL backend.
macro_rules! impl_sql_store {
    ($db_type:ty, $conn:ty, $row:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlStore<$db_type> {
            /// Create tables and indexes if they do not exist.
            pub async fn init(&self) -> crate::storage::Result<()> {
                for statement in <$db_type as SqlDatabase>::SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok(())
            }

            fn record_from_row(
                row: &$row,
            ) -> crate::storage::Result<crate::ledger::IdempotencyRecord> {
                use sqlx::Row;

                let message_id: String = row.try_get("message_id")?;
                let outcome: String = row.try_get("outcome")?;
                let processed_at: String = row.try_get("processed_at")?;

                Ok(crate::ledger::IdempotencyRecord {
                    message_id: crate::storage::parse_uuid(&message_id)?,
                    processed_at: crate::storage::parse_timestamp(&processed_at)?,
                    outcome: crate::ledger::Outcome::parse(&outcome)?,
                })
            }

            fn entry_from_row(row: &$row) -> crate::storage::Result<crate::outbox::OutboxEntry> {
                use sqlx::Row;

                let entry_id: String = row.try_get("entry_id")?;
                let message_id: String = row.try_get("message_id")?;
                let status: String = row.try_get("status")?;
                let attempts: i64 = row.try_get("attempts")?;
                let created_at: String = row.try_get("created_at")?;
                let dispatched_at: Option<String> = row.try_get("dispatched_at")?;

                Ok(crate::outbox::OutboxEntry {
                    entry_id: crate::storage::parse_uuid(&entry_id)?,
                    sequence: row.try_get("sequence")?,
                    aggregate: crate::storage::AggregateRef {
                        kind: row.try_get("aggregate_kind")?,
                        id: row.try_get("aggregate_id")?,
                    },
                    routing_key: row.try_get("routing_key")?,
                    message_id: crate::storage::parse_uuid(&message_id)?,
                    message_type: row.try_get("message_type")?,
                    payload: row.try_get("payload")?,
                    status: crate::outbox::OutboxStatus::parse(&status)?,
                    attempts: u32::try_from(attempts).map_err(|_| {
                        crate::storage::StorageError::Corrupt(format!(
                            "negative attempts {} on entry {}",
                            attempts, entry_id
                        ))
                    })?,
                    last_error: row.try_get("last_error")?,
                    created_at: crate::storage::parse_timestamp(&created_at)?,
                    dispatched_at: dispatched_at
                        .as_deref()
                        .map(crate::storage::parse_timestamp)
                        .transpose()?,
                })
            }

            fn outbox_select() -> sea_query::SelectStatement {
                use sea_query::Query;

                use crate::storage::schema::OutboxEntries;

                Query::select()
                    .columns([
                        OutboxEntries::Sequence,
                        OutboxEntries::EntryId,
                        OutboxEntries::AggregateKind,
                        OutboxEntries::AggregateId,
                        OutboxEntries::RoutingKey,
                        OutboxEntries::MessageId,
                        OutboxEntries::MessageType,
                        OutboxEntries::Payload,
                        OutboxEntries::Status,
                        OutboxEntries::Attempts,
                        OutboxEntries::LastError,
                        OutboxEntries::CreatedAt,
                        OutboxEntries::DispatchedAt,
                    ])
                    .from(OutboxEntries::Table)
                    .to_owned()
            }

            /// Write a unit of work on a connection that is inside a
            /// transaction. The caller commits or rolls back.
            pub(super) async fn stage_in(
                conn: &mut $conn,
                unit: &crate::outbox::UnitOfWork,
            ) -> crate::storage::Result<()> {
                use sea_query::{Expr, Query};

                use crate::storage::schema::{Aggregates, Ledger, OutboxEntries};
                use crate::storage::{format_timestamp, StorageError};

                let message_id = unit.record.message_id;

                // Ledger first: the primary key decides which delivery wins.
                let sql = {
                    let stmt = Query::insert()
                        .into_table(Ledger::Table)
                        .columns([Ledger::MessageId, Ledger::Outcome, Ledger::ProcessedAt])
                        .values_panic([
                            message_id.to_string().into(),
                            unit.record.outcome.as_str().into(),
                            format_timestamp(unit.record.processed_at).into(),
                        ])
                        .to_owned();
                    <$db_type>::build_insert(stmt)
                };
                if let Err(e) = sqlx::query(&sql).execute(&mut *conn).await {
                    if super::is_unique_violation(&e) {
                        return Err(StorageError::DuplicateRecord { message_id });
                    }
                    return Err(e.into());
                }

                if let Some(mutation) = &unit.mutation {
                    let state = serde_json::to_string(&mutation.state)?;
                    let now = format_timestamp(chrono::Utc::now());
                    let conflict = || StorageError::VersionConflict {
                        aggregate: mutation.aggregate.clone(),
                        expected: mutation.expected_version,
                    };

                    match mutation.expected_version {
                        None => {
                            let sql = {
                                let stmt = Query::insert()
                                    .into_table(Aggregates::Table)
                                    .columns([
                                        Aggregates::Kind,
                                        Aggregates::Id,
                                        Aggregates::Version,
                                        Aggregates::State,
                                        Aggregates::UpdatedAt,
                                    ])
                                    .values_panic([
                                        mutation.aggregate.kind.clone().into(),
                                        mutation.aggregate.id.clone().into(),
                                        mutation.next_version().into(),
                                        state.into(),
                                        now.into(),
                                    ])
                                    .to_owned();
                                <$db_type>::build_insert(stmt)
                            };
                            if let Err(e) = sqlx::query(&sql).execute(&mut *conn).await {
                                if super::is_unique_violation(&e) {
                                    return Err(conflict());
                                }
                                return Err(e.into());
                            }
                        }
                        Some(expected) => {
                            let sql = {
                                let stmt = Query::update()
                                    .table(Aggregates::Table)
                                    .value(Aggregates::Version, mutation.next_version())
                                    .value(Aggregates::State, state)
                                    .value(Aggregates::UpdatedAt, now)
                                    .and_where(Expr::col(Aggregates::Kind).eq(mutation.aggregate.kind.as_str()))
                                    .and_where(Expr::col(Aggregates::Id).eq(mutation.aggregate.id.as_str()))
                                    .and_where(Expr::col(Aggregates::Version).eq(expected))
                                    .to_owned();
                                <$db_type>::build_update(stmt)
                            };
                            let result = sqlx::query(&sql).execute(&mut *conn).await?;
                            if result.rows_affected() == 0 {
                                return Err(conflict());
                            }
                        }
                    }
                }

                for entry in &unit.entries {
                    let sql = {
                        let stmt = Query::insert()
                            .into_table(OutboxEntries::Table)
                            .columns([
                                OutboxEntries::EntryId,
                                OutboxEntries::AggregateKind,
                                OutboxEntries::AggregateId,
                                OutboxEntries::RoutingKey,
                                OutboxEntries::MessageId,
                                OutboxEntries::MessageType,
                                OutboxEntries::Payload,
                                OutboxEntries::Status,
                                OutboxEntries::Attempts,
                                OutboxEntries::CreatedAt,
                            ])
                            .values_panic([
                                entry.entry_id.to_string().into(),
                                entry.aggregate.kind.clone().into(),
                                entry.aggregate.id.clone().into(),
                                entry.routing_key.clone().into(),
                                entry.message_id.to_string().into(),
                                entry.message_type.clone().into(),
                                entry.payload.clone().into(),
                                crate::outbox::OutboxStatus::Pending.as_str().into(),
                                0i64.into(),
                                format_timestamp(entry.created_at).into(),
                            ])
                            .to_owned();
                        <$db_type>::build_insert(stmt)
                    };
                    sqlx::query(&sql).execute(&mut *conn).await?;
                }

                Ok(())
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::ledger::IdempotencyLedger for SqlStore<$db_type> {
            async fn has_processed(&self, message_id: uuid::Uuid) -> crate::storage::Result<bool> {
                use sea_query::{Expr, Query};

                use crate::storage::schema::Ledger;

                let sql = {
                    let stmt = Query::select()
                        .column(Ledger::MessageId)
                        .from(Ledger::Table)
                        .and_where(Expr::col(Ledger::MessageId).eq(message_id.to_string()))
                        .limit(1)
                        .to_owned();
                    <$db_type>::build_select(stmt)
                };
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                Ok(row.is_some())
            }

            async fn record_processed(
                &self,
                record: crate::ledger::IdempotencyRecord,
            ) -> crate::storage::Result<()> {
                use sea_query::Query;

                use crate::storage::schema::Ledger;
                use crate::storage::{format_timestamp, StorageError};

                let sql = {
                    let stmt = Query::insert()
                        .into_table(Ledger::Table)
                        .columns([Ledger::MessageId, Ledger::Outcome, Ledger::ProcessedAt])
                        .values_panic([
                            record.message_id.to_string().into(),
                            record.outcome.as_str().into(),
                            format_timestamp(record.processed_at).into(),
                        ])
                        .to_owned();
                    <$db_type>::build_insert(stmt)
                };
                match sqlx::query(&sql).execute(&self.pool).await {
                    Ok(_) => Ok(()),
                    Err(e) if super::is_unique_violation(&e) => Err(StorageError::DuplicateRecord {
                        message_id: record.message_id,
                    }),
                    Err(e) => Err(e.into()),
                }
            }

            async fn get(
                &self,
                message_id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::ledger::IdempotencyRecord>> {
                use sea_query::{Expr, Query};

                use crate::storage::schema::Ledger;

                let sql = {
                    let stmt = Query::select()
                        .columns([Ledger::MessageId, Ledger::Outcome, Ledger::ProcessedAt])
                        .from(Ledger::Table)
                        .and_where(Expr::col(Ledger::MessageId).eq(message_id.to_string()))
                        .to_owned();
                    <$db_type>::build_select(stmt)
                };
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.as_ref().map(Self::record_from_row).transpose()
            }

            async fn prune_before(
                &self,
                cutoff: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<u64> {
                use sea_query::{Expr, Query};

                use crate::storage::format_timestamp;
                use crate::storage::schema::Ledger;

                let sql = {
                    let stmt = Query::delete()
                        .from_table(Ledger::Table)
                        .and_where(Expr::col(Ledger::ProcessedAt).lt(format_timestamp(cutoff)))
                        .to_owned();
                    <$db_type>::build_delete(stmt)
                };
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::storage::AggregateStore for SqlStore<$db_type> {
            async fn load(
                &self,
                aggregate: &crate::storage::AggregateRef,
            ) -> crate::storage::Result<Option<crate::storage::AggregateRecord>> {
                use sea_query::{Expr, Query};
                use sqlx::Row;

                use crate::storage::schema::Aggregates;
                use crate::storage::{parse_timestamp, StorageError};

                let sql = {
                    let stmt = Query::select()
                        .columns([Aggregates::Version, Aggregates::State, Aggregates::UpdatedAt])
                        .from(Aggregates::Table)
                        .and_where(Expr::col(Aggregates::Kind).eq(aggregate.kind.as_str()))
                        .and_where(Expr::col(Aggregates::Id).eq(aggregate.id.as_str()))
                        .to_owned();
                    <$db_type>::build_select(stmt)
                };
                let row = match sqlx::query(&sql).fetch_optional(&self.pool).await? {
                    Some(row) => row,
                    None => return Ok(None),
                };

                let state: String = row.try_get("state")?;
                let updated_at: String = row.try_get("updated_at")?;
                let state = serde_json::from_str(&state).map_err(|e| {
                    StorageError::Corrupt(format!("state of {} is not JSON: {}", aggregate, e))
                })?;

                Ok(Some(crate::storage::AggregateRecord {
                    aggregate: aggregate.clone(),
                    version: row.try_get("version")?,
                    state,
                    updated_at: parse_timestamp(&updated_at)?,
                }))
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::outbox::OutboxStore for SqlStore<$db_type> {
            async fn pending(
                &self,
                limit: usize,
            ) -> crate::storage::Result<Vec<crate::outbox::OutboxEntry>> {
                use sea_query::{Expr, Order};

                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEntries;

                let sql = {
                    let stmt = Self::outbox_select()
                        .and_where(Expr::col(OutboxEntries::Status).eq(OutboxStatus::Pending.as_str()))
                        .order_by(OutboxEntries::Sequence, Order::Asc)
                        .limit(limit as u64)
                        .to_owned();
                    <$db_type>::build_select(stmt)
                };
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::entry_from_row).collect()
            }

            async fn mark_dispatched(
                &self,
                entry_id: uuid::Uuid,
                at: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<()> {
                use sea_query::{Expr, Query};

                use crate::outbox::OutboxStatus;
                use crate::storage::format_timestamp;
                use crate::storage::schema::OutboxEntries;

                let sql = {
                    let stmt = Query::update()
                        .table(OutboxEntries::Table)
                        .value(OutboxEntries::Status, OutboxStatus::Dispatched.as_str())
                        .value(OutboxEntries::DispatchedAt, format_timestamp(at))
                        .and_where(Expr::col(OutboxEntries::EntryId).eq(entry_id.to_string()))
                        .and_where(Expr::col(OutboxEntries::Status).eq(OutboxStatus::Pending.as_str()))
                        .to_owned();
                    <$db_type>::build_update(stmt)
                };
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                if result.rows_affected() == 0 {
                    tracing::debug!(entry_id = %entry_id, "Outbox entry was not pending");
                }
                Ok(())
            }

            async fn record_failure(
                &self,
                entry_id: uuid::Uuid,
                error: &str,
                give_up: bool,
            ) -> crate::storage::Result<()> {
                use sea_query::{Expr, Query};

                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEntries;

                let sql = {
                    let mut stmt = Query::update();
                    stmt.table(OutboxEntries::Table)
                        .value(
                            OutboxEntries::Attempts,
                            Expr::col(OutboxEntries::Attempts).add(1),
                        )
                        .value(OutboxEntries::LastError, error)
                        .and_where(Expr::col(OutboxEntries::EntryId).eq(entry_id.to_string()))
                        .and_where(Expr::col(OutboxEntries::Status).eq(OutboxStatus::Pending.as_str()));
                    if give_up {
                        stmt.value(OutboxEntries::Status, OutboxStatus::Failed.as_str());
                    }
                    <$db_type>::build_update(stmt)
                };
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn get_entry(
                &self,
                entry_id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::outbox::OutboxEntry>> {
                use sea_query::Expr;

                use crate::storage::schema::OutboxEntries;

                let sql = {
                    let stmt = Self::outbox_select()
                        .and_where(Expr::col(OutboxEntries::EntryId).eq(entry_id.to_string()))
                        .to_owned();
                    <$db_type>::build_select(stmt)
                };
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.as_ref().map(Self::entry_from_row).transpose()
            }

            async fn entries_for(
                &self,
                aggregate: &crate::storage::AggregateRef,
            ) -> crate::storage::Result<Vec<crate::outbox::OutboxEntry>> {
                use sea_query::{Expr, Order};

                use crate::storage::schema::OutboxEntries;

                let sql = {
                    let stmt = Self::outbox_select()
                        .and_where(Expr::col(OutboxEntries::AggregateKind).eq(aggregate.kind.as_str()))
                        .and_where(Expr::col(OutboxEntries::AggregateId).eq(aggregate.id.as_str()))
                        .order_by(OutboxEntries::Sequence, Order::Asc)
                        .to_owned();
                    <$db_type>::build_select(stmt)
                };
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::entry_from_row).collect()
            }

            async fn failed_aggregates(
                &self,
            ) -> crate::storage::Result<Vec<crate::storage::AggregateRef>> {
                use sea_query::{Expr, Query};
                use sqlx::Row;

                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEntries;

                let sql = {
                    let stmt = Query::select()
                        .distinct()
                        .columns([OutboxEntries::AggregateKind, OutboxEntries::AggregateId])
                        .from(OutboxEntries::Table)
                        .and_where(Expr::col(OutboxEntries::Status).eq(OutboxStatus::Failed.as_str()))
                        .to_owned();
                    <$db_type>::build_select(stmt)
                };
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter()
                    .map(|row| {
                        Ok(crate::storage::AggregateRef {
                            kind: row.try_get("aggregate_kind")?,
                            id: row.try_get("aggregate_id")?,
                        })
                    })
                    .collect()
            }
        }
    };
}

impl_sql_store!(
    super::postgres::Postgres,
    sqlx::PgConnection,
    sqlx::postgres::PgRow,
    "postgres"
);
impl_sql_store!(
    super::sqlite::Sqlite,
    sqlx::SqliteConnection,
    sqlx::sqlite::SqliteRow,
    "sqlite"
);
