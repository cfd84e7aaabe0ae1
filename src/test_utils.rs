//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bus::{Acker, BusError, ChannelBroker, Delivery};
use crate::dispatch::Dispatcher;
use crate::envelope::Envelope;
use crate::handlers::{CommandHandler, HandlerError, HandlerOutput, HandlerRegistry, OutboundMessage};
use crate::ledger::IdempotencyLedger;
use crate::retry::RetryPolicy;
use crate::storage::{AggregateRecord, AggregateRef, MockStore};

/// Fails with a transient error a fixed number of times, then counts up a
/// `counter` aggregate.
pub struct FlakyHandler {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CommandHandler for FlakyHandler {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let id = envelope.payload["counter_id"].as_str().unwrap_or("default");
        Ok(AggregateRef::new("counter", id))
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        _envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(HandlerError::Transient("downstream timeout".to_string()));
        }

        let count = current
            .and_then(|record| record.state["count"].as_u64())
            .unwrap_or(0)
            + 1;
        Ok(HandlerOutput::new(json!({ "count": count }))
            .emit(OutboundMessage::new("CounterIncremented", json!({ "count": count }))))
    }
}

/// Always panics.
pub struct PanickingHandler;

impl CommandHandler for PanickingHandler {
    fn target(&self, _envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        Ok(AggregateRef::new("counter", "boom"))
    }

    fn handle(
        &self,
        _current: Option<&AggregateRecord>,
        _envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        panic!("handler bug")
    }
}

/// How a tracked delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Acked; `committed` tells whether the ledger already had the message.
    Ack { committed: bool },
    Nack { requeue: bool },
}

/// Acker that records what happened and what the store looked like at ack
/// time.
pub struct RecordingAcker {
    store: Arc<MockStore>,
    message_id: Uuid,
    settlements: Arc<Mutex<Vec<Settlement>>>,
    fail_ack: bool,
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(&self) -> Result<(), BusError> {
        if self.fail_ack {
            return Err(BusError::Connection("connection reset".to_string()));
        }
        let committed = self.store.has_processed(self.message_id).await.unwrap_or(false);
        self.settlements
            .lock()
            .unwrap()
            .push(Settlement::Ack { committed });
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.settlements
            .lock()
            .unwrap()
            .push(Settlement::Nack { requeue });
        Ok(())
    }
}

/// Delivery whose settlement is recorded in the returned log.
pub fn tracked_delivery(
    store: &Arc<MockStore>,
    envelope: &Envelope,
) -> (Delivery, Arc<Mutex<Vec<Settlement>>>) {
    tracked_body(store, envelope.message_id, envelope.encode(), false)
}

/// Delivery whose ack fails as if the connection dropped after commit.
pub fn crashing_delivery(store: &Arc<MockStore>, envelope: &Envelope) -> Delivery {
    tracked_body(store, envelope.message_id, envelope.encode(), true).0
}

pub fn tracked_body(
    store: &Arc<MockStore>,
    message_id: Uuid,
    body: Vec<u8>,
    fail_ack: bool,
) -> (Delivery, Arc<Mutex<Vec<Settlement>>>) {
    let settlements = Arc::new(Mutex::new(Vec::new()));
    let acker = RecordingAcker {
        store: Arc::clone(store),
        message_id,
        settlements: Arc::clone(&settlements),
        fail_ack,
    };
    (Delivery::new(body, false, Box::new(acker)), settlements)
}

/// Dispatcher over a fresh mock store and channel broker.
pub fn dispatcher_with(
    registry: HandlerRegistry,
    policy: RetryPolicy,
) -> (Dispatcher, Arc<MockStore>, ChannelBroker) {
    let store = Arc::new(MockStore::new());
    let broker = ChannelBroker::new();
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        store.clone(),
        Arc::new(broker.clone()),
        policy,
    )
    .with_name("test-worker");
    (dispatcher, store, broker)
}

pub fn create_widget(widget_id: &str, name: &str) -> Envelope {
    Envelope::new("CreateWidget", json!({ "widget_id": widget_id, "name": name }))
}

pub fn counter_command(counter_id: &str) -> Envelope {
    Envelope::new("Increment", json!({ "counter_id": counter_id }))
}

pub fn state_of(record: &Option<AggregateRecord>) -> Value {
    record
        .as_ref()
        .map(|r| r.state.clone())
        .unwrap_or(Value::Null)
}
