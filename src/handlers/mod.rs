//! Command handlers.
//!
//! A handler is a pure function from (current aggregate state, command) to
//! (new state, outbound messages). It never touches the store or the broker;
//! the dispatcher commits its output atomically and relays the outbound
//! messages later. Handlers must not call out to external systems.

use serde_json::Value;

use crate::envelope::{Envelope, EnvelopeError};
use crate::retry::FailureKind;
use crate::storage::{AggregateRecord, AggregateRef};

pub mod control_loop;
pub mod registry;
pub mod sensor;
pub mod widget;

pub use registry::{HandlerRegistry, RegistryError};

/// Errors returned by command handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Payload does not match the command's schema.
    #[error(transparent)]
    Malformed(#[from] EnvelopeError),

    /// Business rule refused the command.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// Temporary condition; the same command may succeed later.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Anything the handler did not classify, including panics.
    #[error("Handler failed: {0}")]
    Unclassified(String),
}

impl HandlerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HandlerError::Malformed(_) | HandlerError::Rejected(_) => FailureKind::Permanent,
            HandlerError::Transient(_) | HandlerError::Unclassified(_) => FailureKind::Transient,
        }
    }
}

/// A message a handler wants published once its state change commits.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_type: String,
    pub payload: Value,
    /// Defaults to the message type.
    pub routing_key: Option<String>,
}

impl OutboundMessage {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            routing_key: None,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.message_type)
    }
}

/// Result of a successful handler invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// New aggregate state, or `None` to leave the aggregate untouched.
    pub state: Option<Value>,
    pub outbound: Vec<OutboundMessage>,
}

impl HandlerOutput {
    pub fn new(state: Value) -> Self {
        Self {
            state: Some(state),
            outbound: Vec::new(),
        }
    }

    pub fn emit(mut self, message: OutboundMessage) -> Self {
        self.outbound.push(message);
        self
    }
}

/// Applies one message type to one aggregate.
pub trait CommandHandler: Send + Sync {
    /// Aggregate the command operates on. Must be a function of the envelope
    /// alone so that redeliveries target the same aggregate.
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError>;

    /// Compute the new state and outbound messages.
    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError>;
}
