//! Fixed-interval background tasks with cooperative shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Handle to a running periodic task.
///
/// Dropping the handle also ends the task, but without waiting for it.
pub struct PeriodicHandle {
    name: &'static str,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeriodicHandle {
    /// Signal the task to stop and wait for the current run to finish.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            warn!(task = self.name, error = %e, "Periodic task ended abnormally");
        }
    }

    /// True once the task loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run `tick` every `interval` until stopped, starting right away.
///
/// A run that overruns the interval pushes the next one back rather than
/// bursting to catch up.
///
/// A run is never interrupted: cancellation is observed between runs, so
/// `stop` waits for an in-flight run to complete.
pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> PeriodicHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!(
            task = name,
            interval_ms = interval.as_millis() as u64,
            "Periodic task started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    tick().await;
                }
            }
        }

        info!(task = name, "Periodic task stopped");
    });

    PeriodicHandle {
        name,
        cancel: cancel_tx,
        task,
    }
}
