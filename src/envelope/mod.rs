//! Message envelope model.
//!
//! Every message on the wire, inbound or outbound, is an [`Envelope`]:
//!
//! ```json
//! {
//!   "message_id": "7d1f6a0e-2b9c-4c7e-9a53-0f1c2d3e4f50",
//!   "type": "CreateWidget",
//!   "payload": {"name": "x"},
//!   "occurred_at": "2024-01-01T00:00:00Z",
//!   "attempt_count": 0
//! }
//! ```
//!
//! `message_id` is the idempotency key. Redeliveries and retries carry the
//! same `message_id`; only `attempt_count` changes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Content type of the envelope wire format.
pub const CONTENT_TYPE: &str = "application/json";

/// Errors produced while decoding envelopes or their payloads.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Typed representation of a broker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique per logical event.
    pub message_id: Uuid,
    /// Tag selecting the handler.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Message body, interpreted by the handler.
    #[serde(default)]
    pub payload: Value,
    /// When the event originally occurred. Producers may omit it; decoding
    /// then stamps the receive time.
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    /// Number of previous failed processing attempts.
    #[serde(default)]
    pub attempt_count: u32,
    /// Links related messages across a workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Message that caused this one to be emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
}

impl Envelope {
    /// Create a fresh envelope with a new message id.
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload,
            occurred_at: Utc::now(),
            attempt_count: 0,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Create an envelope emitted while processing `parent`.
    ///
    /// Inherits the parent's correlation id, or uses the parent's message id
    /// when the parent starts a new workflow.
    pub fn caused_by(parent: &Envelope, message_type: impl Into<String>, payload: Value) -> Self {
        let correlation_id = parent
            .correlation_id
            .clone()
            .unwrap_or_else(|| parent.message_id.to_string());

        Self {
            correlation_id: Some(correlation_id),
            causation_id: Some(parent.message_id),
            ..Self::new(message_type, payload)
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Copy of this envelope for the next delivery attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Parse a raw broker body.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a struct of strings, uuids, timestamps and a JSON value
        // cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode the payload per the declared type's schema.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EnvelopeError::Malformed(format!(
                "payload of {} does not match schema: {}",
                self.message_type, e
            ))
        })
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.message_id.is_nil() {
            return Err(EnvelopeError::Malformed("message_id is nil".to_string()));
        }
        if self.message_type.trim().is_empty() {
            return Err(EnvelopeError::Malformed("type is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
