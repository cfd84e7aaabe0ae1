//! Control loop aggregate.
//!
//! A control loop drives an actuator from a sensor reading towards a set
//! point. A sensor or actuator belongs to at most one loop, so every loop
//! lives in a single registry aggregate and the binding check sees all of
//! them under one version.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::sensor::PeriodUnit;
use super::{CommandHandler, HandlerError, HandlerOutput, HandlerRegistry, OutboundMessage, RegistryError};
use crate::envelope::Envelope;
use crate::storage::{AggregateRecord, AggregateRef};

pub const KIND: &str = "control_loop_registry";
pub const REGISTRY_ID: &str = "default";

pub const REGISTER_CONTROL_LOOP: &str = "RegisterControlLoop";
pub const UPDATE_SET_POINT: &str = "UpdateSetPoint";
pub const SWITCH_CONTROL_BEHAVIOUR: &str = "SwitchControlBehaviour";
pub const CONTROL_LOOP_REGISTERED: &str = "ControlLoopRegistered";
pub const SET_POINT_UPDATED: &str = "SetPointUpdated";
pub const CONTROL_BEHAVIOUR_SWITCHED: &str = "ControlBehaviourSwitched";

/// How a loop turns the error between set point and reading into an
/// actuator output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlBehaviour {
    Proportional { gain: f64 },
}

impl ControlBehaviour {
    fn validate(&self) -> Result<(), HandlerError> {
        match self {
            ControlBehaviour::Proportional { gain } if *gain == 0.0 || !gain.is_finite() => {
                Err(HandlerError::Rejected(format!(
                    "proportional gain must be finite and nonzero, got {}",
                    gain
                )))
            }
            ControlBehaviour::Proportional { .. } => Ok(()),
        }
    }

    /// Actuator output for the current set point and controlled variable.
    pub fn actuator_output(&self, set_point: f64, measured: f64) -> f64 {
        match self {
            ControlBehaviour::Proportional { gain } => gain * (set_point - measured),
        }
    }
}

/// One registered loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlLoop {
    pub sensor_id: String,
    pub actuator_id: String,
    pub set_point: f64,
    pub update_period: u64,
    pub update_period_unit: PeriodUnit,
    pub behaviour: ControlBehaviour,
}

/// Persisted registry state, keyed by loop id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlLoops {
    pub loops: BTreeMap<String, ControlLoop>,
}

impl ControlLoops {
    fn from_record(current: Option<&AggregateRecord>) -> Result<Self, HandlerError> {
        match current {
            Some(record) => serde_json::from_value(record.state.clone()).map_err(|e| {
                HandlerError::Unclassified(format!("stored control loops unreadable: {}", e))
            }),
            None => Ok(Self::default()),
        }
    }

    fn to_state(&self) -> Result<serde_json::Value, HandlerError> {
        serde_json::to_value(self).map_err(|e| HandlerError::Unclassified(e.to_string()))
    }

    /// Loop that already reads `sensor_id`.
    fn sensor_owner(&self, sensor_id: &str) -> Option<&str> {
        self.loops
            .iter()
            .find(|(_, control_loop)| control_loop.sensor_id == sensor_id)
            .map(|(loop_id, _)| loop_id.as_str())
    }

    /// Loop that already drives `actuator_id`.
    fn actuator_owner(&self, actuator_id: &str) -> Option<&str> {
        self.loops
            .iter()
            .find(|(_, control_loop)| control_loop.actuator_id == actuator_id)
            .map(|(loop_id, _)| loop_id.as_str())
    }

    fn get_mut(&mut self, loop_id: &str) -> Result<&mut ControlLoop, HandlerError> {
        self.loops
            .get_mut(loop_id)
            .ok_or_else(|| HandlerError::Rejected(format!("control loop {} not found", loop_id)))
    }
}

#[derive(Debug, Deserialize)]
struct RegisterControlLoopPayload {
    loop_id: String,
    sensor_id: String,
    actuator_id: String,
    set_point: f64,
    update_period: u64,
    #[serde(default)]
    update_period_unit: PeriodUnit,
    behaviour: ControlBehaviour,
}

#[derive(Debug, Deserialize)]
struct UpdateSetPointPayload {
    loop_id: String,
    set_point: f64,
}

#[derive(Debug, Deserialize)]
struct SwitchControlBehaviourPayload {
    loop_id: String,
    behaviour: ControlBehaviour,
}

pub fn register(registry: &mut HandlerRegistry) -> Result<(), RegistryError> {
    registry.register(REGISTER_CONTROL_LOOP, Arc::new(RegisterControlLoop))?;
    registry.register(UPDATE_SET_POINT, Arc::new(UpdateSetPoint))?;
    registry.register(SWITCH_CONTROL_BEHAVIOUR, Arc::new(SwitchControlBehaviour))?;
    Ok(())
}

fn registry_ref() -> AggregateRef {
    AggregateRef::new(KIND, REGISTRY_ID)
}

/// Handles `RegisterControlLoop`.
pub struct RegisterControlLoop;

impl CommandHandler for RegisterControlLoop {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let _: RegisterControlLoopPayload = envelope.payload_as()?;
        Ok(registry_ref())
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: RegisterControlLoopPayload = envelope.payload_as()?;
        let mut loops = ControlLoops::from_record(current)?;

        if loops.loops.contains_key(&payload.loop_id) {
            return Err(HandlerError::Rejected(format!(
                "control loop {} has already been registered",
                payload.loop_id
            )));
        }
        if let Some(owner) = loops.sensor_owner(&payload.sensor_id) {
            return Err(HandlerError::Rejected(format!(
                "sensor {} is already controlled by loop {}",
                payload.sensor_id, owner
            )));
        }
        if let Some(owner) = loops.actuator_owner(&payload.actuator_id) {
            return Err(HandlerError::Rejected(format!(
                "actuator {} is already driven by loop {}",
                payload.actuator_id, owner
            )));
        }
        if payload.update_period == 0 {
            return Err(HandlerError::Rejected(
                "update period must be positive".to_string(),
            ));
        }
        payload.behaviour.validate()?;

        let control_loop = ControlLoop {
            sensor_id: payload.sensor_id,
            actuator_id: payload.actuator_id,
            set_point: payload.set_point,
            update_period: payload.update_period,
            update_period_unit: payload.update_period_unit,
            behaviour: payload.behaviour,
        };
        let event = json!({
            "loop_id": payload.loop_id,
            "sensor_id": control_loop.sensor_id,
            "actuator_id": control_loop.actuator_id,
            "set_point": control_loop.set_point,
            "update_period": control_loop.update_period,
            "update_period_unit": control_loop.update_period_unit,
            "behaviour": control_loop.behaviour,
        });
        loops.loops.insert(payload.loop_id, control_loop);

        Ok(HandlerOutput::new(loops.to_state()?)
            .emit(OutboundMessage::new(CONTROL_LOOP_REGISTERED, event)))
    }
}

/// Handles `UpdateSetPoint`.
pub struct UpdateSetPoint;

impl CommandHandler for UpdateSetPoint {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let _: UpdateSetPointPayload = envelope.payload_as()?;
        Ok(registry_ref())
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: UpdateSetPointPayload = envelope.payload_as()?;
        let mut loops = ControlLoops::from_record(current)?;
        let control_loop = loops.get_mut(&payload.loop_id)?;
        let previous = control_loop.set_point;
        control_loop.set_point = payload.set_point;

        Ok(HandlerOutput::new(loops.to_state()?).emit(OutboundMessage::new(
            SET_POINT_UPDATED,
            json!({
                "loop_id": payload.loop_id,
                "previous_set_point": previous,
                "set_point": payload.set_point,
            }),
        )))
    }
}

/// Handles `SwitchControlBehaviour`.
pub struct SwitchControlBehaviour;

impl CommandHandler for SwitchControlBehaviour {
    fn target(&self, envelope: &Envelope) -> Result<AggregateRef, HandlerError> {
        let _: SwitchControlBehaviourPayload = envelope.payload_as()?;
        Ok(registry_ref())
    }

    fn handle(
        &self,
        current: Option<&AggregateRecord>,
        envelope: &Envelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: SwitchControlBehaviourPayload = envelope.payload_as()?;
        payload.behaviour.validate()?;
        let mut loops = ControlLoops::from_record(current)?;
        let control_loop = loops.get_mut(&payload.loop_id)?;
        let previous = control_loop.behaviour;
        control_loop.behaviour = payload.behaviour;

        Ok(HandlerOutput::new(loops.to_state()?).emit(OutboundMessage::new(
            CONTROL_BEHAVIOUR_SWITCHED,
            json!({
                "loop_id": payload.loop_id,
                "previous_behaviour": previous,
                "behaviour": payload.behaviour,
            }),
        )))
    }
}
