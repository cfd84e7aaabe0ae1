//! Widget aggregate.
//!
//! - `CreateWidget {widget_id?, name}` creates a widget and emits `WidgetCreated`.
//!   Without an explicit id, the id is derived from the message id so that
//!   every redelivery targets the same widget.
//! - `RenameWidget {widget_id, name}` renames it and emits `WidgetRenamed`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{CommandHandler, HandlerError, HandlerOutput, HandlerRegistry, OutboundMessage, RegistryError};
use crate::envelope::Envelope;
use crate::storage::{AggregateRecord, AggregateRef};

/// Aggregate kind for widgets.
pub const KIND: &str = "widget";

pub const CREATE_WIDGET: &str = "CreateWidget";
pub const RENAME_WIDGET: &str = "RenameWidget";
pub const WIDGET_CREATED: &str = "WidgetCreated";
pub const WIDGET_RENAMED: &str = "WidgetRenamed";

/// Persisted widget state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub widget_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct CreateWidgetPayload {
    #[serde(default)]
    widget_id: Option<String>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RenameWidgetPayload {
    widget_id: String,
    name: String,
}

pub fn register(registry: &mut HandlerRegistry) -> Result<(), RegistryError> {
    registry.register(CREATE_WIDGET, Arc::new(CreateWidget))?;
    registry.register(RENAME_WIDGET, Arc::new(RenameWidget))?;
    Ok(())
}

fn validate_name(name: &str) -> Result<(), HandlerError> {
    if name.trim().is_empty() {
        return Err(HandlerError::Rejected("widget name must not be empty".to_string()));
    }
    Ok(())
}

fn widget_state(record: &AggregateRecord) -> Result<Widget, HandlerError> {
    serde_json::from_value(record.state.clone())
        .map_err(|e| HandlerError::Unclassified(format!("stored widget unreadable: {}", e)))
}

/// Handles `CreateWidget`.
pub struct CreateWidget;

impl CreateWidget {
    fn widget_id(envelope: &Envelope, payload: &CreateWidgetPayload) -> String {
        payload
            .widget_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, envelope.message_id.as_bytes()).to_string())
    }
}

impl CommandHandler for CreateWidget {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let payload: CreateWidgetPayload = envelope.payload_as()?;
        Ok(AggregateRef::new(KIND, Self::widget_id(envelope, &payload)))
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: CreateWidgetPayload = envelope.payload_as()?;
        let widget_id = Self::widget_id(envelope, &payload);

        if current.is_some() {
            return Err(HandlerError::Rejected(format!(
                "widget {} already exists",
                widget_id
            )));
        }
        validate_name(&payload.name)?;

        let widget = Widget {
            widget_id,
            name: payload.name,
        };
        let state = serde_json::to_value(&widget)
            .map_err(|e| HandlerError::Unclassified(e.to_string()))?;

        Ok(HandlerOutput::new(state.clone()).emit(OutboundMessage::new(WIDGET_CREATED, state)))
    }
}

/// Handles `RenameWidget`.
pub struct RenameWidget;

impl CommandHandler for RenameWidget {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let payload: RenameWidgetPayload = envelope.payload_as()?;
        Ok(AggregateRef::new(KIND, payload.widget_id))
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: RenameWidgetPayload = envelope.payload_as()?;
        let record = current.ok_or_else(|| {
            HandlerError::Rejected(format!("widget {} does not exist", payload.widget_id))
        })?;
        validate_name(&payload.name)?;

        let mut widget = widget_state(record)?;
        let previous_name = std::mem::replace(&mut widget.name, payload.name);
        let state = serde_json::to_value(&widget)
            .map_err(|e| HandlerError::Unclassified(e.to_string()))?;

        Ok(HandlerOutput::new(state).emit(OutboundMessage::new(
            WIDGET_RENAMED,
            json!({
                "widget_id": widget.widget_id,
                "previous_name": previous_name,
                "name": widget.name,
            }),
        )))
    }
}
