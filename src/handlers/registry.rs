//! Message type to handler mapping.
//!
//! Built once at startup and shared read-only between workers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{control_loop, sensor, widget, CommandHandler};

/// Errors raised while building or querying the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler already registered for message type '{0}'")]
    AlreadyRegistered(String),

    #[error("Unknown message type '{0}'")]
    UnknownMessageType(String),
}

/// Maps message types to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler.
    pub fn with_builtin_handlers() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        widget::register(&mut registry)?;
        sensor::register(&mut registry)?;
        control_loop::register(&mut registry)?;
        Ok(registry)
    }

    /// Register `handler` for `message_type`. Each type has exactly one
    /// handler.
    pub fn register(
        &mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RegistryError> {
        let message_type = message_type.into();
        if self.handlers.contains_key(&message_type) {
            return Err(RegistryError::AlreadyRegistered(message_type));
        }
        debug!(message_type = %message_type, "Handler registered");
        self.handlers.insert(message_type, handler);
        Ok(())
    }

    /// Handler for `message_type`.
    pub fn resolve(&self, message_type: &str) -> Result<&dyn CommandHandler, RegistryError> {
        self.handlers
            .get(message_type)
            .map(|handler| handler.as_ref())
            .ok_or_else(|| RegistryError::UnknownMessageType(message_type.to_string()))
    }

    /// Registered message types, sorted.
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
