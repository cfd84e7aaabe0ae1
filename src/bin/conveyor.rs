//! conveyor: command processor
//!
//! Consumes command envelopes from the broker, applies them through the
//! registered handlers, and relays the resulting messages from the outbox.
//!
//! ## Architecture
//! ```text
//! [Broker queue] -> [Dispatch workers] -> [Handlers]
//!                          |
//!                          v (one transaction)
//!              [Ledger + Aggregates + Outbox]
//!                          |
//!                          v
//!                  [Outbox relay] -> [Broker exchange]
//! ```
//!
//! ## Configuration
//! - CONVEYOR_CONFIG or the first argument: YAML configuration file
//! - CONVEYOR__STORAGE__TYPE: sqlite | postgres
//! - CONVEYOR__MESSAGING__TYPE: channel | amqp
//! - CONVEYOR_LOG: tracing filter (default "info")

use std::sync::Arc;

use tracing::{error, info};

use conveyor::bus::init_broker;
use conveyor::config::Config;
use conveyor::dispatch::{DispatchLoop, Dispatcher};
use conveyor::handlers::HandlerRegistry;
use conveyor::ledger::spawn_retention_task;
use conveyor::outbox::relay::{spawn_relay_task, OutboxRelay};
use conveyor::retry::RetryPolicy;
use conveyor::storage::init_storage;
use conveyor::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        storage = %config.storage.storage_type,
        workers = config.processing.workers,
        "Starting conveyor"
    );

    let store = connect_with_retry("storage", || init_storage(&config.storage)).await?;
    let broker = connect_with_retry("broker", || init_broker(&config.messaging)).await?;

    let registry = Arc::new(HandlerRegistry::with_builtin_handlers()?);
    info!(message_types = ?registry.message_types(), "Handlers registered");

    let dispatcher = Dispatcher::new(
        registry,
        Arc::clone(&store),
        Arc::clone(&broker),
        RetryPolicy::from(&config.processing),
    )
    .with_name("worker");
    let workers = DispatchLoop::new(dispatcher).spawn(config.processing.workers);

    let relay = Arc::new(OutboxRelay::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        &config.outbox,
    ));
    let relay_task = spawn_relay_task(Arc::clone(&relay), config.outbox.relay_poll_interval());

    let retention_task = spawn_retention_task(
        Arc::clone(&store),
        config.ledger.retention_window(),
        config.ledger.prune_interval(),
    );

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");

    // Workers first so in-flight deliveries commit and ack before the last
    // relay pass.
    workers.shutdown().await;
    relay_task.stop().await;
    retention_task.stop().await;
    if let Err(e) = relay.relay_once().await {
        error!(error = %e, "Final outbox relay pass failed");
    }

    info!("Shutdown complete");
    Ok(())
}
