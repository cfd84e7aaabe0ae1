//! AMQP (RabbitMQ) broker implementation.
//!
//! Topology declared on connect:
//! - `{queue}`: durable work queue consumed by the dispatch workers,
//!   optionally bound to an inbound exchange. Rejected deliveries go to the
//!   dead-letter exchange.
//! - `{queue}.retry`: holding queue without consumers. Each retry carries a
//!   per-message expiration; on expiry the broker moves it back to `{queue}`.
//!   Messages expire only at the head of the queue, so a short delay queued
//!   behind a longer one waits for the longer one. `max_delay` bounds that
//!   wait.
//! - `{dead_letter_exchange}` with `{queue}.dlq` bound to it.
//! - `{exchange}`: topic exchange for outbound messages.
//!
//! Every channel runs in confirm mode, so a publish returns only after the
//! broker took responsibility for the message. Each consumer publishes its
//! retries and dead letters on its own channel; the broker's own publisher
//! channel serves the outbox relay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Acker, BusError, Consumer, Delivery, MessageBroker, OutgoingMessage, Result};
use crate::config::AmqpBusConfig;
use crate::envelope::CONTENT_TYPE;

/// Header carrying the dead-letter reason.
const REASON_HEADER: &str = "x-conveyor-reason";

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

fn retry_queue(queue: &str) -> String {
    format!("{}.retry", queue)
}

fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(value.into())
}

/// Arguments for the work queue: rejections without requeue are
/// dead-lettered.
fn work_queue_args(config: &AmqpBusConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        long_string(&config.dead_letter_exchange),
    );
    args.insert("x-dead-letter-routing-key".into(), long_string(&config.queue));
    args
}

/// Arguments for the retry queue: expired messages return to the work queue
/// through the default exchange.
fn retry_queue_args(config: &AmqpBusConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-dead-letter-exchange".into(), long_string(""));
    args.insert("x-dead-letter-routing-key".into(), long_string(&config.queue));
    args
}

fn connection_error(context: &str, e: impl std::fmt::Display) -> BusError {
    BusError::Connection(format!("{}: {}", context, e))
}

/// RabbitMQ broker.
pub struct AmqpBroker {
    pool: Pool,
    config: AmqpBusConfig,
    /// Confirm-mode channel for this handle's publishes, reopened when it
    /// dies. Never shared with another consumer's handle.
    publisher: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    /// Connect and declare the topology.
    pub async fn connect(config: AmqpBusConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .build()
            .map_err(|e| connection_error("Failed to create pool", e))?;

        let broker = Self {
            pool,
            config,
            publisher: Mutex::new(None),
        };
        broker.declare_topology().await?;

        info!(
            url = %broker.config.url,
            queue = %broker.config.queue,
            exchange = %broker.config.exchange,
            "Connected to AMQP"
        );
        Ok(broker)
    }

    /// Handle on the same connection pool that publishes on `channel`.
    fn bound_to(&self, channel: Channel) -> Self {
        Self {
            pool: self.pool.clone(),
            config: self.config.clone(),
            publisher: Mutex::new(Some(channel)),
        }
    }

    async fn open_channel(&self) -> Result<Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e: PoolError| connection_error("Failed to get connection from pool", e))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| connection_error("Failed to create channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| connection_error("Failed to enable publisher confirms", e))?;
        Ok(channel)
    }

    async fn declare_exchange(channel: &Channel, name: &str) -> Result<()> {
        channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare exchange {}: {}", name, e)))
    }

    async fn declare_queue(channel: &Channel, name: &str, args: FieldTable) -> Result<()> {
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue {}: {}", name, e)))
    }

    async fn bind(channel: &Channel, queue: &str, exchange: &str, key: &str) -> Result<()> {
        channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind {} to {}: {}", queue, exchange, e)))
    }

    async fn declare_topology(&self) -> Result<()> {
        let config = &self.config;
        let channel = self.open_channel().await?;

        Self::declare_exchange(&channel, &config.exchange).await?;
        Self::declare_exchange(&channel, &config.dead_letter_exchange).await?;

        let dlq = dead_letter_queue(&config.queue);
        Self::declare_queue(&channel, &dlq, FieldTable::default()).await?;
        Self::bind(&channel, &dlq, &config.dead_letter_exchange, "#").await?;

        Self::declare_queue(&channel, &config.queue, work_queue_args(config)).await?;
        if let Some(inbound) = &config.inbound_exchange {
            Self::declare_exchange(&channel, inbound).await?;
            Self::bind(&channel, &config.queue, inbound, &config.inbound_binding).await?;
        }

        Self::declare_queue(&channel, &retry_queue(&config.queue), retry_queue_args(config)).await?;

        debug!(queue = %config.queue, dlq = %dlq, "AMQP topology declared");
        Ok(())
    }

    /// Publish with confirm on this handle's publisher channel.
    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let mut publisher = self.publisher.lock().await;
        let channel = match publisher.as_ref() {
            Some(channel) if channel.status().connected() => channel.clone(),
            _ => {
                let channel = self.open_channel().await?;
                *publisher = Some(channel.clone());
                channel
            }
        };

        let confirm = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                *publisher = None;
                return Err(connection_error("Failed to publish", e));
            }
        };

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Err(BusError::Nacked(format!(
                "exchange {:?} routing key {}",
                exchange, routing_key
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                *publisher = None;
                Err(connection_error("Publish confirmation failed", e))
            }
        }
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn consumer(&self, tag: &str) -> Result<Box<dyn Consumer>> {
        let channel = self.open_channel().await?;
        channel
            .basic_qos(self.config.prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(|e| connection_error("Failed to set prefetch", e))?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        debug!(queue = %self.config.queue, tag = %tag, "AMQP consumer started");
        Ok(Box::new(AmqpConsumer {
            consumer,
            bound: Arc::new(self.bound_to(channel)),
        }))
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(message_id = %message.message_id, routing_key = %message.routing_key))]
    async fn publish(&self, message: OutgoingMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(message.message_id.to_string().into())
            .with_type(message.message_type.as_str().into())
            .with_content_type(message.content_type.as_str().into())
            .with_delivery_mode(PERSISTENT);

        self.publish_confirmed(
            &self.config.exchange,
            &message.routing_key,
            &message.body,
            properties,
        )
        .await?;
        debug!(exchange = %self.config.exchange, "Published");
        Ok(())
    }

    async fn schedule_retry(&self, body: Vec<u8>, delay: Duration) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_expiration(delay.as_millis().to_string().into());

        self.publish_confirmed("", &retry_queue(&self.config.queue), &body, properties)
            .await
    }

    async fn dead_letter(&self, body: Vec<u8>, reason: &str) -> Result<()> {
        let mut headers = FieldTable::default();
        headers.insert(REASON_HEADER.into(), long_string(reason));
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);

        let result = self
            .publish_confirmed(
                &self.config.dead_letter_exchange,
                &self.config.queue,
                &body,
                properties,
            )
            .await;
        if let Err(e) = &result {
            warn!(error = %e, "Dead-letter publish failed");
        }
        result
    }
}

struct AmqpConsumer {
    consumer: lapin::Consumer,
    // Holds the consumer's channel. Closing it cancels the consumer and
    // requeues unacked deliveries.
    bound: Arc<AmqpBroker>,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(Some(Delivery::new(
                delivery.data,
                delivery.redelivered,
                Box::new(AmqpAcker {
                    acker: delivery.acker,
                }),
            ))),
            Some(Err(e)) => Err(connection_error("Consumer delivery error", e)),
            None => Ok(None),
        }
    }

    fn broker(&self) -> Option<Arc<dyn MessageBroker>> {
        Some(Arc::clone(&self.bound) as Arc<dyn MessageBroker>)
    }
}

struct AmqpAcker {
    acker: LapinAcker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| connection_error("Failed to ack", e))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| connection_error("Failed to nack", e))
    }
}


/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test --features amqp amqp_integration -- --ignored
#[cfg(test)]
mod amqp_integration {
    use super::*;
    use crate::envelope::Envelope;
    use serde_json::json;

    fn config() -> AmqpBusConfig {
        AmqpBusConfig {
            url: std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string()),
            queue: format!("test-commands-{}", uuid::Uuid::new_v4()),
            ..Default::default()
        }
    }

    async fn next_body(consumer: &mut Box<dyn Consumer>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), consumer.next())
            .await
            .expect("Timed out waiting for message")
            .expect("Consumer failed")
            .expect("Consumer closed")
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_scheduled_retry_returns_to_work_queue() {
        let broker = AmqpBroker::connect(config()).await.expect("Failed to connect");
        let mut consumer = broker.consumer("test").await.unwrap();

        let envelope = Envelope::new("CreateWidget", json!({"name": "retry"})).next_attempt();
        broker
            .schedule_retry(envelope.encode(), Duration::from_millis(200))
            .await
            .unwrap();

        let delivery = next_body(&mut consumer).await;
        let received = Envelope::decode(&delivery.body).unwrap();
        assert_eq!(received.message_id, envelope.message_id);
        assert_eq!(received.attempt_count, 1);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_nack_with_requeue_redelivers() {
        let broker = AmqpBroker::connect(config()).await.expect("Failed to connect");
        let mut consumer = broker.consumer("test").await.unwrap();

        let body = Envelope::new("CreateWidget", json!({"name": "requeue"})).encode();
        broker.schedule_retry(body.clone(), Duration::ZERO).await.unwrap();

        let first = next_body(&mut consumer).await;
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = next_body(&mut consumer).await;
        assert!(second.redelivered);
        assert_eq!(second.body, body);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_publish_is_confirmed() {
        let broker = AmqpBroker::connect(config()).await.expect("Failed to connect");
        let envelope = Envelope::new("WidgetCreated", json!({"widget_id": "w-1"}));

        broker
            .publish(OutgoingMessage::from_envelope("widget.w-1", &envelope))
            .await
            .expect("Publish should be confirmed");
        broker
            .dead_letter(envelope.encode(), "test")
            .await
            .expect("Dead letter should be confirmed");
    }
}
