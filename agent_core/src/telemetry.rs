//! Action bus boundary between the interpreter and an agent's modules.

use std::collections::{BTreeMap, BTreeSet};

use bevy::math::Vec2;
use program_runtime::ValueKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource_field::ResourceField;

/// Value published by a module signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Boolean(bool),
    Number(f64),
    Vector(Vec2),
    Text(String),
}

impl SignalValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SignalValue::Number(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SignalValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<Vec2> {
        match self {
            SignalValue::Vector(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            SignalValue::Number(_) => Some(ValueKind::Number),
            SignalValue::Boolean(_) => Some(ValueKind::Boolean),
            SignalValue::Vector(_) | SignalValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub value: SignalValue,
    /// Monotonic per publisher; bumps whenever the value may have changed.
    pub revision: u64,
}

/// `values[module][signal]` as published at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub values: BTreeMap<String, BTreeMap<String, SignalSample>>,
}

impl TelemetrySnapshot {
    pub fn insert(
        &mut self,
        module_id: impl Into<String>,
        signal_id: impl Into<String>,
        value: SignalValue,
        revision: u64,
    ) {
        self.values
            .entry(module_id.into())
            .or_default()
            .insert(signal_id.into(), SignalSample { value, revision });
    }

    pub fn get(&self, module_id: &str, signal_id: &str) -> Option<&SignalSample> {
        self.values.get(module_id)?.get(signal_id)
    }

    pub fn number(&self, module_id: &str, signal_id: &str) -> Option<f64> {
        self.get(module_id, signal_id)?.value.as_number()
    }

    pub fn boolean(&self, module_id: &str, signal_id: &str) -> Option<bool> {
        self.get(module_id, signal_id)?.value.as_bool()
    }

    pub fn vector(&self, module_id: &str, signal_id: &str) -> Option<Vec2> {
        self.get(module_id, signal_id)?.value.as_vector()
    }
}

/// Named modules exposing actions and telemetry for one agent.
///
/// `invoke_action` returns `None` when the module is not installed; the
/// interpreter tolerates that and carries on.
pub trait ActionBus {
    fn invoke_action(
        &mut self,
        module_id: &str,
        action: &str,
        payload: Value,
        field: &mut ResourceField,
    ) -> Option<Value>;

    fn telemetry(&self) -> TelemetrySnapshot;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCall {
    pub module_id: String,
    pub action: String,
    pub payload: Value,
}

/// Bus that records every call and answers from canned responses.
///
/// Modules answer `{}` unless a response was registered for the action;
/// modules marked absent answer `None`.
#[derive(Debug, Default)]
pub struct RecordingBus {
    calls: Vec<ActionCall>,
    responses: BTreeMap<(String, String), Vec<Value>>,
    absent: BTreeSet<String>,
    pub snapshot: TelemetrySnapshot,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response; the last queued response repeats once the rest are used.
    pub fn respond(&mut self, module_id: &str, action: &str, response: Value) {
        self.responses
            .entry((module_id.to_string(), action.to_string()))
            .or_default()
            .push(response);
    }

    pub fn mark_absent(&mut self, module_id: &str) {
        self.absent.insert(module_id.to_string());
    }

    pub fn set_signal(&mut self, module_id: &str, signal_id: &str, value: SignalValue) {
        let revision = self
            .snapshot
            .get(module_id, signal_id)
            .map_or(1, |sample| sample.revision + 1);
        self.snapshot.insert(module_id, signal_id, value, revision);
    }

    pub fn calls(&self) -> &[ActionCall] {
        &self.calls
    }

    pub fn calls_to(&self, action: &str) -> Vec<&ActionCall> {
        self.calls.iter().filter(|call| call.action == action).collect()
    }

    pub fn last_call(&self, action: &str) -> Option<&ActionCall> {
        self.calls.iter().rev().find(|call| call.action == action)
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }
}

impl ActionBus for RecordingBus {
    fn invoke_action(
        &mut self,
        module_id: &str,
        action: &str,
        payload: Value,
        _field: &mut ResourceField,
    ) -> Option<Value> {
        if self.absent.contains(module_id) {
            return None;
        }
        self.calls.push(ActionCall {
            module_id: module_id.to_string(),
            action: action.to_string(),
            payload,
        });
        let key = (module_id.to_string(), action.to_string());
        let response = match self.responses.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue.first().cloned().unwrap_or_else(|| Value::Object(Default::default())),
            None => Value::Object(Default::default()),
        };
        Some(response)
    }

    fn telemetry(&self) -> TelemetrySnapshot {
        self.snapshot.clone()
    }
}
