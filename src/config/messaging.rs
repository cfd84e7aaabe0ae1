//! Messaging and broker configuration types.

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process channel broker (no external broker).
    #[default]
    Channel,
    /// AMQP/RabbitMQ messaging.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpBusConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Queue consumed by the dispatch workers.
    pub queue: String,
    /// Optional exchange the inbound queue is bound to.
    pub inbound_exchange: Option<String>,
    /// Binding key used when `inbound_exchange` is set.
    pub inbound_binding: String,
    /// Topic exchange outbound messages are published to.
    pub exchange: String,
    /// Exchange dead letters are published to.
    pub dead_letter_exchange: String,
    /// Unacknowledged deliveries per worker channel.
    pub prefetch: u16,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            queue: "conveyor.commands".to_string(),
            inbound_exchange: None,
            inbound_binding: "#".to_string(),
            exchange: "conveyor.events".to_string(),
            dead_letter_exchange: "conveyor.dlx".to_string(),
            prefetch: 1,
            pool_size: 10,
        }
    }
}
