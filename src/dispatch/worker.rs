//! Worker pool.
//!
//! Each worker owns a broker consumer and processes one delivery at a time.
//! Retries and dead letters go out through the consumer's own broker handle
//! when it has one.
//! Shutdown is observed only while waiting for the next delivery, so a
//! message that has been received is always processed to completion.

use std::time::Duration;

use backon::Retryable;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Dispatcher;
use crate::bus::{BusError, Consumer};
use crate::utils::backoff::reconnect_backoff;

/// Pause before reopening a consumer the broker closed.
const CONSUMER_REOPEN_DELAY: Duration = Duration::from_millis(500);

/// Spawns workers that feed deliveries to a [`Dispatcher`].
pub struct DispatchLoop {
    dispatcher: Dispatcher,
}

impl DispatchLoop {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Start `workers` workers, each with its own consumer.
    pub fn spawn(self, workers: usize) -> DispatchHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = (0..workers.max(1))
            .map(|index| {
                let dispatcher = self
                    .dispatcher
                    .clone()
                    .with_name(format!("{}-{}", self.dispatcher.name(), index));
                tokio::spawn(run_worker(dispatcher, shutdown_rx.clone()))
            })
            .collect::<Vec<_>>();

        info!(workers = tasks.len(), "Dispatch loop started");
        DispatchHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle to running workers.
pub struct DispatchHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatchHandle {
    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting deliveries and wait for in-flight messages to finish.
    pub async fn shutdown(self) {
        info!("Dispatch loop shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Dispatch loop stopped");
    }
}

/// Resolves once shutdown was requested. Never resolves if the handle was
/// dropped without requesting it.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn open_consumer(dispatcher: &Dispatcher) -> Result<Box<dyn Consumer>, BusError> {
    let broker = dispatcher.broker();
    let tag = dispatcher.name();

    (|| async { broker.consumer(tag).await })
        .retry(reconnect_backoff())
        .notify(|err: &BusError, dur: Duration| {
            warn!(worker = %tag, error = %err, delay = ?dur, "Consumer unavailable, retrying");
        })
        .await
}

async fn run_worker(dispatcher: Dispatcher, mut shutdown: watch::Receiver<bool>) {
    let worker = dispatcher.name().to_string();
    info!(worker = %worker, "Worker started");

    'connect: loop {
        let mut consumer = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break 'connect,
            opened = open_consumer(&dispatcher) => match opened {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(worker = %worker, error = %e, "Could not open consumer, worker exiting");
                    break 'connect;
                }
            },
        };
        debug!(worker = %worker, "Consumer opened");
        let bound = match consumer.broker() {
            Some(broker) => dispatcher.with_broker(broker),
            None => dispatcher.clone(),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break 'connect,
                next = consumer.next() => next,
            };

            match next {
                Ok(Some(delivery)) => match bound.process(delivery).await {
                    Ok(disposition) => {
                        debug!(worker = %worker, disposition = ?disposition, "Delivery settled")
                    }
                    Err(e) if e.is_unavailable() => {
                        warn!(worker = %worker, error = %e, "Broker lost while settling, reconnecting");
                        continue 'connect;
                    }
                    Err(e) => {
                        warn!(worker = %worker, error = %e, "Delivery could not be settled");
                    }
                },
                Ok(None) => {
                    warn!(worker = %worker, "Consumer closed by broker, reopening");
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => break 'connect,
                        _ = tokio::time::sleep(CONSUMER_REOPEN_DELAY) => continue 'connect,
                    }
                }
                Err(e) => {
                    warn!(worker = %worker, error = %e, "Consumer failed, reconnecting");
                    continue 'connect;
                }
            }
        }
    }

    info!(worker = %worker, "Worker stopped");
}
