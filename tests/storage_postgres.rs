//! PostgreSQL storage integration tests using testcontainers.
//!
//! Run with: cargo test --test storage_postgres --features postgres -- --ignored --nocapture
//!
//! These tests spin up PostgreSQL in a container using testcontainers-rs,
//! create the schema, and test all storage interfaces.

mod storage;

use std::time::Duration;

use conveyor::storage::sql::postgres::PostgresStore;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start PostgreSQL container.
///
/// Returns (container, connection_string) where connection_string is suitable
/// for sqlx PgPool connection.
async fn start_postgres() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    // PostgreSQL prints "database system is ready to accept connections" twice:
    // once during initial setup and once when fully ready.
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "conveyor")
        .with_env_var("POSTGRES_PASSWORD", "conveyor")
        .with_env_var("POSTGRES_DB", "conveyor")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let host_port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let connection_string = format!("postgres://conveyor:conveyor@{}:{}/conveyor", host, host_port);

    println!("PostgreSQL available at: {}", connection_string);

    (container, connection_string)
}

async fn connect_and_init(connection_string: &str) -> PostgresStore {
    let pool = sqlx::PgPool::connect(connection_string)
        .await
        .expect("Failed to connect to PostgreSQL");

    let store = PostgresStore::new(pool);
    store.init().await.expect("Failed to create schema");
    store
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_postgres_ledger() {
    println!("=== PostgreSQL IdempotencyLedger Tests ===");

    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_init(&connection_string).await;

    run_ledger_tests!(&store);

    println!("=== All PostgreSQL IdempotencyLedger tests PASSED ===");
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_postgres_unit_of_work() {
    println!("=== PostgreSQL TransactionalOutbox Tests ===");

    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_init(&connection_string).await;

    run_unit_of_work_tests!(&store);

    println!("=== All PostgreSQL TransactionalOutbox tests PASSED ===");
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_postgres_outbox() {
    println!("=== PostgreSQL OutboxStore Tests ===");

    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_init(&connection_string).await;

    run_outbox_tests!(&store);

    println!("=== All PostgreSQL OutboxStore tests PASSED ===");
    // Container is dropped here, stopping PostgreSQL
}
