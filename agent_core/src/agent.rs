//! Reference [`ActionBus`] with a kinematic body and the standard module set.

use std::collections::{BTreeMap, BTreeSet};

use bevy::math::Vec2;
use program_runtime::registry::{
    INVENTORY_MODULE, MANIPULATOR_MODULE, MOVEMENT_MODULE, SCANNER_MODULE, STATUS_MODULE,
    STORAGE_MODULE,
};
use program_runtime::ModuleRegistry;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{AgentConfig, FieldDefaults};
use crate::navigator::{wrap_angle, Pose};
use crate::resource_field::{HarvestOptions, HitOptions, HitStatus, ResourceField, ScanOptions};
use crate::telemetry::{ActionBus, SignalValue, TelemetrySnapshot};

/// Storage contents: box id to resource id to quantity.
pub type StorageBoxes = BTreeMap<String, BTreeMap<String, f32>>;

#[derive(Debug, Clone)]
pub struct SimulatedAgent {
    pose: Pose,
    linear_velocity: Vec2,
    angular_velocity: f32,
    installed: BTreeSet<String>,
    field_defaults: FieldDefaults,
    cargo: BTreeMap<String, f32>,
    cargo_capacity: f32,
    tool_slots: Vec<Option<String>>,
    storage: StorageBoxes,
    default_box: String,
    status_active: bool,
    last_scan_hits: usize,
    last_filter: Option<String>,
    last_harvest: f32,
    revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub pose: Pose,
    pub cargo: BTreeMap<String, f32>,
    pub storage: StorageBoxes,
    pub status_active: bool,
}

impl SimulatedAgent {
    /// Agent at `position` facing +x with every module of `registry` installed.
    pub fn new(
        position: Vec2,
        registry: &ModuleRegistry,
        agent: &AgentConfig,
        field_defaults: &FieldDefaults,
    ) -> Self {
        let tool_slots = agent
            .tool_slots
            .iter()
            .map(|tool| {
                let tool = tool.trim();
                (!tool.is_empty()).then(|| tool.to_string())
            })
            .collect();
        Self {
            pose: Pose {
                position,
                orientation: 0.0,
            },
            linear_velocity: Vec2::ZERO,
            angular_velocity: 0.0,
            installed: registry.modules().iter().map(|module| module.id.clone()).collect(),
            field_defaults: field_defaults.clone(),
            cargo: BTreeMap::new(),
            cargo_capacity: agent.cargo_capacity.max(0.0),
            tool_slots,
            storage: BTreeMap::new(),
            default_box: agent.default_box.clone(),
            status_active: false,
            last_scan_hits: 0,
            last_filter: None,
            last_harvest: 0.0,
            revision: 0,
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
        self.bump();
    }

    pub fn linear_velocity(&self) -> Vec2 {
        self.linear_velocity
    }

    pub fn angular_velocity(&self) -> f32 {
        self.angular_velocity
    }

    pub fn cargo(&self) -> &BTreeMap<String, f32> {
        &self.cargo
    }

    pub fn cargo_total(&self) -> f32 {
        self.cargo.values().sum()
    }

    pub fn storage(&self) -> &StorageBoxes {
        &self.storage
    }

    pub fn status_active(&self) -> bool {
        self.status_active
    }

    pub fn set_status_active(&mut self, active: bool) {
        self.status_active = active;
        self.bump();
    }

    pub fn is_installed(&self, module_id: &str) -> bool {
        self.installed.contains(module_id)
    }

    /// Removes a module; its actions then answer `None` and its signals vanish.
    pub fn uninstall(&mut self, module_id: &str) -> bool {
        let removed = self.installed.remove(module_id);
        if removed {
            self.bump();
        }
        removed
    }

    pub fn install(&mut self, module_id: &str) {
        if self.installed.insert(module_id.to_string()) {
            self.bump();
        }
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            pose: self.pose,
            cargo: self.cargo.clone(),
            storage: self.storage.clone(),
            status_active: self.status_active,
        }
    }

    /// Integrates the commanded velocities over `dt` seconds.
    pub fn step(&mut self, dt: f32) {
        if !dt.is_finite() || dt <= 0.0 {
            return;
        }
        if self.linear_velocity == Vec2::ZERO && self.angular_velocity == 0.0 {
            return;
        }
        self.pose.position += self.linear_velocity * dt;
        self.pose.orientation = wrap_angle(self.pose.orientation + self.angular_velocity * dt);
        self.bump();
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    fn movement(&mut self, action: &str, payload: &Value) -> Value {
        match action {
            "setLinearVelocity" => {
                let x = number_field(payload, "x").unwrap_or(0.0) as f32;
                let y = number_field(payload, "y").unwrap_or(0.0) as f32;
                let velocity = Vec2::new(x, y);
                self.linear_velocity = if velocity.is_finite() { velocity } else { Vec2::ZERO };
                json!({ "ok": true })
            }
            "setAngularVelocity" => {
                let value = number_field(payload, "value").unwrap_or(0.0) as f32;
                self.angular_velocity = if value.is_finite() { value } else { 0.0 };
                json!({ "ok": true })
            }
            _ => unknown_action(MOVEMENT_MODULE, action),
        }
    }

    fn scanner(&mut self, action: &str, payload: &Value, field: &ResourceField) -> Value {
        if action != "scan" {
            return unknown_action(SCANNER_MODULE, action);
        }
        let filter = payload
            .get("filter")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut options = ScanOptions::new(
            self.pose.position,
            self.pose.orientation,
            self.field_defaults.scan_range,
        );
        options.fov_degrees = Some(self.field_defaults.scan_fov_degrees);
        options.max_results = Some(self.field_defaults.scan_max_results);
        options.resource_type = filter;
        let result = field.scan(&options);
        self.last_scan_hits = result.hits.len();
        self.last_filter = result.filter.clone();
        self.bump();
        serde_json::to_value(&result).unwrap_or(Value::Null)
    }

    fn manipulator(&mut self, action: &str, payload: &Value, field: &mut ResourceField) -> Value {
        if action != "gather" {
            return unknown_action(MANIPULATOR_MODULE, action);
        }
        let Some(node_id) = payload.get("nodeId").and_then(Value::as_str) else {
            return json!({ "status": "invalid-target" });
        };
        let space = (self.cargo_capacity - self.cargo_total()).max(0.0);
        if space <= 0.0 {
            return json!({ "status": "cargo-full", "nodeId": node_id });
        }
        let mut options = HarvestOptions::new(node_id, self.field_defaults.gather_amount.min(space))
            .from_origin(self.pose.position);
        options.max_distance = Some(self.field_defaults.harvest_distance);
        let result = field.harvest(options);
        if result.harvested > 0.0 {
            if let Some(kind) = &result.resource_type {
                *self.cargo.entry(kind.clone()).or_default() += result.harvested;
            }
        }
        self.last_harvest = result.harvested;
        self.bump();
        serde_json::to_value(&result).unwrap_or(Value::Null)
    }

    fn inventory(&mut self, action: &str, payload: &Value, field: &mut ResourceField) -> Value {
        match action {
            "useItem" => self.use_item(payload, field),
            "storeDefault" => {
                let default_box = self.default_box.clone();
                let stored = self.transfer_to_box(&default_box, None, None);
                json!({ "boxId": default_box, "stored": stored })
            }
            _ => unknown_action(INVENTORY_MODULE, action),
        }
    }

    fn use_item(&mut self, payload: &Value, field: &mut ResourceField) -> Value {
        let slot = number_field(payload, "slot").unwrap_or(1.0);
        if !slot.is_finite() || slot < 1.0 || slot as usize > self.tool_slots.len() {
            return json!({ "status": "invalid-slot" });
        }
        let Some(tool) = self.tool_slots[slot as usize - 1].clone() else {
            return json!({ "status": "empty-slot" });
        };

        let node_id = payload
            .get("nodeId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                let target = payload.get("target")?;
                let point = Vec2::new(
                    number_field(target, "x")? as f32,
                    number_field(target, "y")? as f32,
                );
                field.nearest_node(point, None).map(|node| node.id.clone())
            });
        let Some(node_id) = node_id else {
            return json!({ "status": "invalid-target" });
        };

        let mut options = HitOptions::new(node_id, Some(tool)).from_origin(self.pose.position);
        options.max_distance = Some(self.field_defaults.harvest_distance);
        let result = field.register_hit(options);
        self.bump();
        let status = match result.status {
            HitStatus::Ok => "ok",
            HitStatus::Depleted => "depleted",
            HitStatus::InvalidTool => "invalid-item",
            HitStatus::OutOfRange => "invalid-target",
            HitStatus::NotFound => "not-found",
        };
        json!({
            "status": status,
            "nodeId": result.node_id,
            "remaining": result.remaining,
            "drop": result.drop,
        })
    }

    fn storage_link(&mut self, action: &str, payload: &Value) -> Value {
        let box_id = payload
            .get("boxId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.default_box.clone());
        let resource = payload.get("resourceId").and_then(Value::as_str).map(str::to_string);
        let amount = number_field(payload, "amount").map(|amount| amount as f32);
        match action {
            "store" => {
                let stored = self.transfer_to_box(&box_id, resource.as_deref(), amount);
                json!({ "boxId": box_id, "stored": stored })
            }
            "withdraw" => {
                let withdrawn = self.transfer_from_box(&box_id, resource.as_deref(), amount);
                json!({ "boxId": box_id, "withdrawn": withdrawn })
            }
            _ => unknown_action(STORAGE_MODULE, action),
        }
    }

    fn status_control(&mut self, action: &str, payload: &Value) -> Value {
        match action {
            "toggleStatus" => {
                self.status_active = !self.status_active;
            }
            "setStatus" => {
                self.status_active = payload.get("value").and_then(Value::as_bool).unwrap_or(false);
            }
            _ => return unknown_action(STATUS_MODULE, action),
        }
        self.bump();
        json!({ "active": self.status_active })
    }

    /// Moves cargo into a box; `None` resource moves every kind.
    fn transfer_to_box(&mut self, box_id: &str, resource: Option<&str>, amount: Option<f32>) -> f32 {
        let mut budget = amount.filter(|amount| amount.is_finite() && *amount > 0.0).unwrap_or(f32::INFINITY);
        let mut moved = 0.0;
        let kinds: Vec<String> = self
            .cargo
            .keys()
            .filter(|kind| resource.map_or(true, |wanted| kind.eq_ignore_ascii_case(wanted)))
            .cloned()
            .collect();
        for kind in kinds {
            if budget <= 0.0 {
                break;
            }
            let held = self.cargo.get(&kind).copied().unwrap_or(0.0);
            let take = held.min(budget);
            if take <= 0.0 {
                continue;
            }
            budget -= take;
            moved += take;
            if held - take <= 0.0 {
                self.cargo.remove(&kind);
            } else {
                self.cargo.insert(kind.clone(), held - take);
            }
            *self
                .storage
                .entry(box_id.to_string())
                .or_default()
                .entry(kind)
                .or_default() += take;
        }
        if moved > 0.0 {
            self.bump();
        }
        moved
    }

    fn transfer_from_box(&mut self, box_id: &str, resource: Option<&str>, amount: Option<f32>) -> f32 {
        let space = (self.cargo_capacity - self.cargo_total()).max(0.0);
        let mut budget = amount
            .filter(|amount| amount.is_finite() && *amount > 0.0)
            .unwrap_or(f32::INFINITY)
            .min(space);
        let Some(contents) = self.storage.get_mut(box_id) else {
            return 0.0;
        };
        let kinds: Vec<String> = contents
            .keys()
            .filter(|kind| resource.map_or(true, |wanted| kind.eq_ignore_ascii_case(wanted)))
            .cloned()
            .collect();
        let mut moved = 0.0;
        for kind in kinds {
            if budget <= 0.0 {
                break;
            }
            let held = contents.get(&kind).copied().unwrap_or(0.0);
            let take = held.min(budget);
            if take <= 0.0 {
                continue;
            }
            budget -= take;
            moved += take;
            if held - take <= 0.0 {
                contents.remove(&kind);
            } else {
                contents.insert(kind.clone(), held - take);
            }
            *self.cargo.entry(kind).or_default() += take;
        }
        if moved > 0.0 {
            self.bump();
        }
        moved
    }
}

impl ActionBus for SimulatedAgent {
    fn invoke_action(
        &mut self,
        module_id: &str,
        action: &str,
        payload: Value,
        field: &mut ResourceField,
    ) -> Option<Value> {
        if !self.installed.contains(module_id) {
            return None;
        }
        let response = match module_id {
            MOVEMENT_MODULE => self.movement(action, &payload),
            SCANNER_MODULE => self.scanner(action, &payload, field),
            MANIPULATOR_MODULE => self.manipulator(action, &payload, field),
            INVENTORY_MODULE => self.inventory(action, &payload, field),
            STORAGE_MODULE => self.storage_link(action, &payload),
            STATUS_MODULE => self.status_control(action, &payload),
            other => unknown_action(other, action),
        };
        Some(response)
    }

    fn telemetry(&self) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::default();
        let revision = self.revision;
        let mut publish = |module: &str, signal: &str, value: SignalValue| {
            if self.installed.contains(module) {
                snapshot.insert(module, signal, value, revision);
            }
        };

        let position = self.pose.position;
        publish(MOVEMENT_MODULE, "position", SignalValue::Vector(position));
        publish(MOVEMENT_MODULE, "positionX", SignalValue::Number(position.x as f64));
        publish(MOVEMENT_MODULE, "positionY", SignalValue::Number(position.y as f64));
        publish(
            MOVEMENT_MODULE,
            "orientation",
            SignalValue::Number(self.pose.orientation as f64),
        );
        publish(
            MOVEMENT_MODULE,
            "speed",
            SignalValue::Number(self.linear_velocity.length() as f64),
        );
        publish(SCANNER_MODULE, "hits", SignalValue::Number(self.last_scan_hits as f64));
        publish(
            SCANNER_MODULE,
            "lastFilter",
            SignalValue::Text(self.last_filter.clone().unwrap_or_default()),
        );
        publish(
            MANIPULATOR_MODULE,
            "lastHarvest",
            SignalValue::Number(self.last_harvest as f64),
        );
        let cargo_total = self.cargo_total();
        publish(INVENTORY_MODULE, "cargo.total", SignalValue::Number(cargo_total as f64));
        publish(
            INVENTORY_MODULE,
            "cargo.full",
            SignalValue::Boolean(cargo_total >= self.cargo_capacity),
        );
        let stored: f32 = self.storage.values().flat_map(|contents| contents.values()).sum();
        publish(STORAGE_MODULE, "stored.total", SignalValue::Number(stored as f64));
        publish(STATUS_MODULE, "active", SignalValue::Boolean(self.status_active));
        snapshot
    }
}

fn number_field(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

fn unknown_action(module_id: &str, action: &str) -> Value {
    debug!(target: "rover::engine", module = module_id, action, "action.unknown");
    json!({ "status": "unknown-action" })
}
