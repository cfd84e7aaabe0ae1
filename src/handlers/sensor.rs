//! Sensor aggregate.
//!
//! Sensors sample a signal at a fixed period. Registration fixes the signal
//! unit; the sampling period can be changed afterwards.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{CommandHandler, HandlerError, HandlerOutput, HandlerRegistry, OutboundMessage, RegistryError};
use crate::envelope::Envelope;
use crate::storage::{AggregateRecord, AggregateRef};

pub const KIND: &str = "sensor";

pub const REGISTER_SENSOR: &str = "RegisterSensor";
pub const UPDATE_SAMPLING_PERIOD: &str = "UpdateSamplingPeriod";
pub const SENSOR_REGISTERED: &str = "SensorRegistered";
pub const SAMPLING_PERIOD_UPDATED: &str = "SamplingPeriodUpdated";

/// Unit of the sampling period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
}

/// Persisted sensor state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: String,
    pub signal_unit: String,
    pub sampling_period: u64,
    pub sampling_period_unit: PeriodUnit,
}

#[derive(Debug, Deserialize)]
struct RegisterSensorPayload {
    sensor_id: String,
    signal_unit: String,
    sampling_period: u64,
    #[serde(default)]
    sampling_period_unit: PeriodUnit,
}

#[derive(Debug, Deserialize)]
struct UpdateSamplingPeriodPayload {
    sensor_id: String,
    sampling_period: u64,
}

pub fn register(registry: &mut HandlerRegistry) -> Result<(), RegistryError> {
    registry.register(REGISTER_SENSOR, Arc::new(RegisterSensor))?;
    registry.register(UPDATE_SAMPLING_PERIOD, Arc::new(UpdateSamplingPeriod))?;
    Ok(())
}

fn require_positive_period(period: u64) -> Result<(), HandlerError> {
    if period == 0 {
        return Err(HandlerError::Rejected(
            "sampling period must be positive".to_string(),
        ));
    }
    Ok(())
}

fn to_state(sensor: &Sensor) -> Result<serde_json::Value, HandlerError> {
    serde_json::to_value(sensor).map_err(|e| HandlerError::Unclassified(e.to_string()))
}

/// Handles `RegisterSensor`.
pub struct RegisterSensor;

impl CommandHandler for RegisterSensor {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let payload: RegisterSensorPayload = envelope.payload_as()?;
        Ok(AggregateRef::new(KIND, payload.sensor_id))
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: RegisterSensorPayload = envelope.payload_as()?;
        if current.is_some() {
            return Err(HandlerError::Rejected(format!(
                "a sensor with id {} already exists",
                payload.sensor_id
            )));
        }
        require_positive_period(payload.sampling_period)?;

        let sensor = Sensor {
            sensor_id: payload.sensor_id,
            signal_unit: payload.signal_unit,
            sampling_period: payload.sampling_period,
            sampling_period_unit: payload.sampling_period_unit,
        };
        let state = to_state(&sensor)?;

        Ok(HandlerOutput::new(state.clone()).emit(OutboundMessage::new(SENSOR_REGISTERED, state)))
    }
}

/// Handles `UpdateSamplingPeriod`.
pub struct UpdateSamplingPeriod;

impl CommandHandler for UpdateSamplingPeriod {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let payload: UpdateSamplingPeriodPayload = envelope.payload_as()?;
        Ok(AggregateRef::new(KIND, payload.sensor_id))
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: UpdateSamplingPeriodPayload = envelope.payload_as()?;
        let record = current.ok_or_else(|| {
            HandlerError::Rejected(format!("sensor with id {} not found", payload.sensor_id))
        })?;
        require_positive_period(payload.sampling_period)?;

        let mut sensor: Sensor = serde_json::from_value(record.state.clone())
            .map_err(|e| HandlerError::Unclassified(format!("stored sensor unreadable: {}", e)))?;
        let previous = sensor.sampling_period;
        sensor.sampling_period = payload.sampling_period;

        Ok(HandlerOutput::new(to_state(&sensor)?).emit(OutboundMessage::new(
            SAMPLING_PERIOD_UPDATED,
            json!({
                "sensor_id": sensor.sensor_id,
                "previous_sampling_period": previous,
                "sampling_period": sensor.sampling_period,
                "sampling_period_unit": sensor.sampling_period_unit,
            }),
        )))
    }
}
