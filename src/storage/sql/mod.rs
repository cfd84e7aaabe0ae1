//! Unified SQL storage implementation.
//!
//! One store implementation shared by the SQL backends (PostgreSQL, SQLite),
//! parameterized by database type using the `SqlDatabase` trait.

mod query;
mod store;

pub use query::SqlDatabase;
pub use store::SqlStore;

/// True if `err` is a primary key or unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(feature = "postgres")]
pub mod postgres {
    //! PostgreSQL database backend.

    use sea_query::PostgresQueryBuilder;
    use sqlx::PgPool;

    use crate::outbox::{TransactionalOutbox, UnitOfWork};
    use crate::storage::{Result, StorageError};

    use crate::storage::schema::POSTGRES_SCHEMA;

    /// PostgreSQL database marker type.
    pub struct Postgres;

    impl super::SqlDatabase for Postgres {
        type Pool = PgPool;

        const SCHEMA: &'static [&'static str] = POSTGRES_SCHEMA;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_update(stmt: sea_query::UpdateStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }
    }

    /// PostgreSQL store.
    pub type PostgresStore = super::SqlStore<Postgres>;

    #[async_trait::async_trait]
    impl TransactionalOutbox for PostgresStore {
        async fn stage(&self, unit: UnitOfWork) -> Result<()> {
            // An uncommitted transaction rolls back when dropped, including on
            // cancellation.
            let mut tx = self.pool().begin().await?;

            let result = match PostgresStore::stage_in(&mut *tx, &unit).await {
                Ok(()) => tx.commit().await.map_err(StorageError::from),
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        tracing::warn!(error = %rollback, "Rollback failed");
                    }
                    Err(e)
                }
            };

            super::store::log_unit(&unit, &result);
            result
        }
    }
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! SQLite database backend.

    use sea_query::SqliteQueryBuilder;
    use sqlx::SqlitePool;

    use crate::outbox::{TransactionalOutbox, UnitOfWork};
    use crate::storage::{Result, StorageError};

    use crate::storage::schema::SQLITE_SCHEMA;

    /// SQLite database marker type.
    pub struct Sqlite;

    impl super::SqlDatabase for Sqlite {
        type Pool = SqlitePool;

        const SCHEMA: &'static [&'static str] = SQLITE_SCHEMA;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_update(stmt: sea_query::UpdateStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }
    }

    /// SQLite store.
    pub type SqliteStore = super::SqlStore<Sqlite>;

    #[async_trait::async_trait]
    impl TransactionalOutbox for SqliteStore {
        async fn stage(&self, unit: UnitOfWork) -> Result<()> {
            let mut conn = self.pool().acquire().await?;
            // Writers take the lock at BEGIN and wait on the busy timeout.
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

            let result = match SqliteStore::stage_in(&mut *conn, &unit).await {
                Ok(()) => sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map(|_| ())
                    .map_err(StorageError::from),
                Err(e) => Err(e),
            };

            if result.is_err() {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
            }

            super::store::log_unit(&unit, &result);
            result
        }
    }
}
