//! In-memory broker for standalone mode.
//!
//! Behaves like a single durable work queue: each inbound message goes to one
//! consumer, unsettled deliveries are requeued (flagged redelivered) when they
//! are nacked with requeue or dropped, and delayed retries reappear after
//! their delay. Published and dead-lettered messages are kept in memory for
//! inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{Acker, BusError, Consumer, Delivery, MessageBroker, OutgoingMessage, Result};

/// A message parked on the dead-letter destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetteredMessage {
    pub body: Vec<u8>,
    pub reason: String,
}

struct Queued {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
    published: Mutex<Vec<OutgoingMessage>>,
    dead_letters: Mutex<Vec<DeadLetteredMessage>>,
    in_flight: AtomicUsize,
    scheduled: AtomicUsize,
    fail_on_publish: AtomicBool,
    fail_on_retry: AtomicBool,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn enqueue(&self, body: Vec<u8>, redelivered: bool) {
        lock(&self.queue).push_back(Queued { body, redelivered });
        self.notify.notify_one();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Connection("channel broker unavailable".to_string()));
        }
        Ok(())
    }
}

/// In-memory broker using a shared queue.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    inner: Arc<Inner>,
}

impl ChannelBroker {
    pub fn new() -> Self {
        info!("Channel broker initialized");
        Self::default()
    }

    /// Deliver a message to the inbound queue, as an upstream producer would.
    pub fn publish_inbound(&self, body: Vec<u8>) {
        self.inner.enqueue(body, false);
    }

    /// Messages confirmed on the outbound exchange, in publish order.
    pub fn published(&self) -> Vec<OutgoingMessage> {
        lock(&self.inner.published).clone()
    }

    /// Messages routed to the dead-letter destination.
    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        lock(&self.inner.dead_letters).clone()
    }

    /// Messages waiting in the inbound queue.
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// True when nothing is queued, delivered-but-unsettled, or waiting on a
    /// retry delay.
    pub fn is_idle(&self) -> bool {
        self.queued() == 0
            && self.inner.in_flight.load(Ordering::SeqCst) == 0
            && self.inner.scheduled.load(Ordering::SeqCst) == 0
    }

    /// Wait until [`is_idle`](Self::is_idle) holds or `timeout` elapses.
    /// Returns whether the broker went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_idle() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.is_idle()
    }

    /// Make outbound publishes fail with a non-connection error.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Make retry scheduling fail.
    pub fn set_fail_on_retry(&self, fail: bool) {
        self.inner.fail_on_retry.store(fail, Ordering::SeqCst);
    }

    /// Simulate losing the broker: every operation fails with
    /// [`BusError::Connection`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Close all consumers. Pending `next` calls return `Ok(None)`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

#[async_trait]
impl MessageBroker for ChannelBroker {
    async fn consumer(&self, tag: &str) -> Result<Box<dyn Consumer>> {
        self.inner.check_available()?;
        debug!(tag = %tag, "Channel consumer opened");
        Ok(Box::new(ChannelConsumer {
            inner: Arc::clone(&self.inner),
        }))
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(message_id = %message.message_id, routing_key = %message.routing_key))]
    async fn publish(&self, message: OutgoingMessage) -> Result<()> {
        self.inner.check_available()?;
        if self.inner.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("simulated publish failure".to_string()));
        }
        lock(&self.inner.published).push(message);
        debug!("Published to channel");
        Ok(())
    }

    async fn schedule_retry(&self, body: Vec<u8>, delay: Duration) -> Result<()> {
        self.inner.check_available()?;
        if self.inner.fail_on_retry.load(Ordering::SeqCst) {
            return Err(BusError::Publish("simulated retry failure".to_string()));
        }

        self.inner.scheduled.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.enqueue(body, false);
            inner.scheduled.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn dead_letter(&self, body: Vec<u8>, reason: &str) -> Result<()> {
        self.inner.check_available()?;
        lock(&self.inner.dead_letters).push(DeadLetteredMessage {
            body,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

struct ChannelConsumer {
    inner: Arc<Inner>,
}

#[async_trait]
impl Consumer for ChannelConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.check_available()?;

            let next = {
                let mut queue = lock(&self.inner.queue);
                let next = queue.pop_front();
                if next.is_some() {
                    // Counted under the queue lock so is_idle never sees a gap.
                    self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                }
                next
            };
            if let Some(queued) = next {
                let acker = ChannelAcker {
                    inner: Arc::clone(&self.inner),
                    body: queued.body.clone(),
                    settled: AtomicBool::new(false),
                };
                return Ok(Some(Delivery::new(
                    queued.body,
                    queued.redelivered,
                    Box::new(acker),
                )));
            }

            notified.await;
        }
    }
}

struct ChannelAcker {
    inner: Arc<Inner>,
    body: Vec<u8>,
    settled: AtomicBool,
}

impl ChannelAcker {
    /// Returns true the first time only.
    fn settle(&self) -> bool {
        let first = !self.settled.swap(true, Ordering::SeqCst);
        if first {
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        first
    }
}

#[async_trait]
impl Acker for ChannelAcker {
    async fn ack(&self) -> Result<()> {
        self.inner.check_available()?;
        if !self.settle() {
            return Err(BusError::Ack("delivery already settled".to_string()));
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.inner.check_available()?;
        if !self.settle() {
            return Err(BusError::Ack("delivery already settled".to_string()));
        }
        if requeue {
            self.inner.enqueue(self.body.clone(), true);
        } else {
            lock(&self.inner.dead_letters).push(DeadLetteredMessage {
                body: self.body.clone(),
                reason: "rejected without requeue".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for ChannelAcker {
    fn drop(&mut self) {
        // Unsettled on drop: the broker would redeliver once the channel closes.
        if self.settle() {
            self.inner.enqueue(std::mem::take(&mut self.body), true);
        }
    }
}
