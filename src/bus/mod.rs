//! Message broker abstraction.
//!
//! This module contains:
//! - `MessageBroker` trait: consume inbound commands, publish outbound messages
//! - `Consumer` / `Delivery`: per-worker receive side with explicit ack/nack
//! - Implementations: AMQP (RabbitMQ), in-memory channel broker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{MessagingConfig, MessagingType};
use crate::envelope::{Envelope, CONTENT_TYPE};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(any(test, feature = "channel"))]
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
#[cfg(any(test, feature = "channel"))]
pub use channel::ChannelBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable. Not a per-message failure: callers pause and
    /// reconnect instead of charging the message.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish not confirmed by broker: {0}")]
    Nacked(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),
}

impl BusError {
    /// True if the broker itself is unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BusError::Connection(_))
    }
}

/// A message to publish to the outbound exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub routing_key: String,
    pub message_id: Uuid,
    pub message_type: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn from_envelope(routing_key: impl Into<String>, envelope: &Envelope) -> Self {
        Self {
            routing_key: routing_key.into(),
            message_id: envelope.message_id,
            message_type: envelope.message_type.clone(),
            content_type: CONTENT_TYPE.to_string(),
            body: envelope.encode(),
        }
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Confirm processing. The broker will not redeliver.
    async fn ack(&self) -> Result<()>;

    /// Reject. With `requeue` the broker redelivers; without, it discards
    /// (or dead-letters, depending on queue topology).
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One message received from the inbound queue.
///
/// Settling consumes the delivery, so a message is acked or nacked at most
/// once. A delivery dropped unsettled is redelivered by the broker once the
/// consumer goes away.
pub struct Delivery {
    pub body: Vec<u8>,
    /// Broker-reported redelivery flag.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Receive side owned by a single worker.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `Ok(None)` means the broker closed the
    /// consumer and no more deliveries will arrive on it.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Broker handle that publishes on this consumer's own channel.
    ///
    /// Retries and dead letters for this consumer's deliveries go through it.
    /// `None` when the broker has no per-consumer channels.
    fn broker(&self) -> Option<Arc<dyn MessageBroker>> {
        None
    }
}

/// Interface to the message broker.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: in-memory broker for standalone mode and tests
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Open a consumer on the inbound queue with its own channel.
    async fn consumer(&self, tag: &str) -> Result<Box<dyn Consumer>>;

    /// Publish to the outbound exchange. Returns once the broker confirmed.
    async fn publish(&self, message: OutgoingMessage) -> Result<()>;

    /// Redeliver `body` to the inbound queue after `delay`.
    async fn schedule_retry(&self, body: Vec<u8>, delay: Duration) -> Result<()>;

    /// Route `body` to the dead-letter destination.
    async fn dead_letter(&self, body: Vec<u8>, reason: &str) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker based on configuration.
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn MessageBroker>> {
    match config.messaging_type {
        #[cfg(feature = "channel")]
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Broker initialized");
            Ok(Arc::new(ChannelBroker::new()))
        }
        #[cfg(feature = "amqp")]
        MessagingType::Amqp => {
            let broker = AmqpBroker::connect(config.amqp.clone()).await?;
            info!(messaging_type = "amqp", queue = %config.amqp.queue, "Broker initialized");
            Ok(Arc::new(broker))
        }
        #[allow(unreachable_patterns)]
        ref other => {
            error!(messaging_type = ?other, "Messaging backend not compiled in");
            Err(BusError::Connection(format!(
                "messaging type {:?} requires its cargo feature",
                other
            )))
        }
    }
}
