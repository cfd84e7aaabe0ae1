//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Messages that cannot be processed (malformed, unknown type, rejected by
//! their handler, or out of retry budget) are wrapped in a [`DeadLetter`] and
//! published to the dead-letter destination for manual review and replay.
//!
//! ## Message Format
//!
//! A JSON document carrying:
//! - The original broker body, base64 encoded, byte for byte
//! - Envelope identity when the body could be decoded
//! - Rejection cause and human-readable reason
//! - Metadata (source worker, attempt count, timestamp)

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::MessageBroker;
use crate::envelope::Envelope;

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),

    #[error("Invalid dead letter: {0}")]
    InvalidDeadLetter(String),
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterCause {
    /// Body is not a valid envelope, or the payload does not match its schema.
    Malformed,
    /// No handler registered for the message type.
    UnknownMessageType,
    /// Handler refused the command on business grounds.
    Rejected,
    /// Transient failures outlasted the retry budget.
    RetriesExhausted,
}

impl std::fmt::Display for DeadLetterCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeadLetterCause::Malformed => "malformed",
            DeadLetterCause::UnknownMessageType => "unknown_message_type",
            DeadLetterCause::Rejected => "rejected",
            DeadLetterCause::RetriesExhausted => "retries_exhausted",
        };
        f.write_str(name)
    }
}

/// Dead letter queue entry for a failed inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Original broker body, base64 encoded.
    pub original: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub cause: DeadLetterCause,
    /// Human-readable reason for rejection.
    pub reason: String,
    /// Failed attempts before dead-lettering.
    pub attempt_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    /// Which worker sent it here.
    pub source: String,
}

impl DeadLetter {
    /// Dead letter for a decoded envelope.
    pub fn for_envelope(
        body: &[u8],
        envelope: &Envelope,
        cause: DeadLetterCause,
        reason: impl Into<String>,
        source: &str,
    ) -> Self {
        Self {
            message_id: Some(envelope.message_id),
            message_type: Some(envelope.message_type.clone()),
            correlation_id: envelope.correlation_id.clone(),
            attempt_count: envelope.attempt_count,
            ..Self::for_body(body, cause, reason, source)
        }
    }

    /// Dead letter for a body that could not be decoded.
    pub fn for_body(
        body: &[u8],
        cause: DeadLetterCause,
        reason: impl Into<String>,
        source: &str,
    ) -> Self {
        Self {
            original: BASE64_STANDARD.encode(body),
            message_id: None,
            message_type: None,
            correlation_id: None,
            cause,
            reason: reason.into(),
            attempt_count: 0,
            dead_lettered_at: Utc::now(),
            source: source.to_string(),
        }
    }

    /// The original broker body, for inspection or replay.
    pub fn original_bytes(&self) -> Result<Vec<u8>, DlqError> {
        BASE64_STANDARD
            .decode(&self.original)
            .map_err(|e| DlqError::InvalidDeadLetter(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DlqError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DlqError> {
        serde_json::from_slice(bytes).map_err(|e| DlqError::InvalidDeadLetter(e.to_string()))
    }
}

/// Trait for publishing messages to a dead letter queue.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter.
    ///
    /// Returns Ok(()) once the destination accepted it.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;
}

/// Publishes dead letters through the message broker's dead-letter route.
pub struct BrokerDeadLetterPublisher {
    broker: Arc<dyn MessageBroker>,
}

impl BrokerDeadLetterPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl DeadLetterPublisher for BrokerDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        let body = dead_letter.to_bytes()?;
        self.broker
            .dead_letter(body, &dead_letter.reason)
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;

        warn!(
            message_id = ?dead_letter.message_id,
            cause = %dead_letter.cause,
            reason = %dead_letter.reason,
            source = %dead_letter.source,
            "Message dead-lettered"
        );
        Ok(())
    }
}

/// In-memory DLQ publisher using a channel.
///
/// Used for testing.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Create a new channel-based DLQ publisher.
    ///
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            cause = %dead_letter.cause,
            reason = %dead_letter.reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}
