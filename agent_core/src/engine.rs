//! Time-stepped interpreter for compiled block programs.
//!
//! The engine owns an explicit frame stack over an immutable
//! [`CompiledProgram`]. Frames address their body by a path of
//! `(instruction index, arm)` pairs from the program root, so nothing borrows
//! into the program across calls.

use std::fmt;
use std::sync::Arc;

use bevy::math::Vec2;
use crossbeam_channel::{unbounded, Receiver};
use program_runtime::{
    ActionKind, BlockInstruction, CompiledProgram, InstructionKind, LoopMode, ModuleRegistry,
    NumberBinding, StorageRequest, TargetBinding,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::binding::{evaluate_boolean, evaluate_number};
use crate::config::EngineConfig;
use crate::navigator::{Navigator, Pose, SteeringCommand};
use crate::resource_field::{ListenerId, ResourceField, ScanHit, ScanResult};
use crate::telemetry::{ActionBus, TelemetrySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Idle,
    Running,
    Completed,
    Error,
}

/// Hits of the most recent scan, nearest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ScanMemory {
    pub filter: Option<String>,
    pub hits: Vec<ScanHit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugFrameKind {
    Sequence,
    Loop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugFrame {
    pub kind: DebugFrameKind,
    pub index: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    pub status: EngineStatus,
    pub program: Option<Arc<CompiledProgram>>,
    pub current_instruction: Option<BlockInstruction>,
    pub time_remaining: f32,
    pub frames: Vec<DebugFrame>,
}

pub type DebugListener = Box<dyn FnMut(&DebugState) + Send + Sync>;
pub type StatusListener = Box<dyn FnMut(EngineStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arm {
    Body,
    WhenTrue,
    WhenFalse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Sequence,
    LoopForever,
    LoopCounted { remaining: u32 },
}

#[derive(Debug, Clone)]
struct Frame {
    path: Vec<(usize, Arm)>,
    len: usize,
    cursor: usize,
    kind: FrameKind,
}

#[derive(Debug, Clone)]
struct SwingState {
    slot: u32,
    node_id: Option<String>,
    target: Vec2,
    swings_remaining: u32,
    /// Armed after a successful swing while swings remain.
    cooldown: Option<f32>,
}

#[derive(Debug, Clone)]
struct ActiveInstruction {
    instruction: BlockInstruction,
    remaining: f32,
    swing: Option<SwingState>,
    /// Set when the instruction ends before its duration elapses.
    finished: bool,
}

#[derive(Debug, Clone)]
struct ResolvedTarget {
    node_id: Option<String>,
    position: Vec2,
}

pub struct ExecutionEngine {
    registry: Arc<ModuleRegistry>,
    config: Arc<EngineConfig>,
    navigator: Navigator,
    status: EngineStatus,
    program: Option<Arc<CompiledProgram>>,
    frames: Vec<Frame>,
    current: Option<ActiveInstruction>,
    scan_memory: ScanMemory,
    debug_listeners: Vec<(ListenerId, DebugListener)>,
    status_listeners: Vec<(ListenerId, StatusListener)>,
    next_listener: u64,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("status", &self.status)
            .field("frames", &self.frames)
            .field("current", &self.current)
            .field("scan_memory", &self.scan_memory)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ModuleRegistry>, config: Arc<EngineConfig>) -> Self {
        let navigator = Navigator::new(config.navigator.clone());
        Self {
            registry,
            config,
            navigator,
            status: EngineStatus::Idle,
            program: None,
            frames: Vec::new(),
            current: None,
            scan_memory: ScanMemory::default(),
            debug_listeners: Vec::new(),
            status_listeners: Vec::new(),
            next_listener: 0,
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn program(&self) -> Option<&Arc<CompiledProgram>> {
        self.program.as_ref()
    }

    pub fn scan_memory(&self) -> &ScanMemory {
        &self.scan_memory
    }

    pub fn current_instruction(&self) -> Option<&BlockInstruction> {
        self.current.as_ref().map(|active| &active.instruction)
    }

    /// Replaces any running program. Sub-state is reset and movement is
    /// driven to zero before this returns.
    pub fn load(
        &mut self,
        program: impl Into<Arc<CompiledProgram>>,
        bus: &mut dyn ActionBus,
        field: &mut ResourceField,
    ) {
        let program = program.into();
        self.reset_substate();
        self.stop_movement(bus, field);

        let len = program.instructions.len();
        debug!(
            target: "rover::engine",
            instructions = program.instruction_count(),
            "program.loaded"
        );
        self.program = Some(program);
        let status = if len == 0 {
            EngineStatus::Completed
        } else {
            self.frames.push(Frame {
                path: Vec::new(),
                len,
                cursor: 0,
                kind: FrameKind::Sequence,
            });
            EngineStatus::Running
        };
        // A reload announces its status even when it matches the previous one.
        self.status = status;
        self.notify_status();
        self.publish_debug();
    }

    /// Halts execution and returns to idle; the loaded program is kept.
    pub fn stop(&mut self, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        self.reset_substate();
        self.stop_movement(bus, field);
        debug!(target: "rover::engine", "program.stopped");
        self.set_status(EngineStatus::Idle);
        self.publish_debug();
    }

    /// Consumes `dt` seconds of program time.
    pub fn update(&mut self, dt: f32, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        if self.status != EngineStatus::Running {
            return;
        }
        let epsilon = self.config.timing.epsilon;
        let cap = self.config.timing.max_zero_time_advances;
        let mut budget = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        let mut zero_time_advances = 0u32;

        while self.status == EngineStatus::Running {
            let needs_advance = match &self.current {
                None => true,
                Some(active) => active.finished || active.remaining <= epsilon,
            };
            if needs_advance {
                if let Some(done) = self.current.take() {
                    debug!(target: "rover::engine", instruction = %done.instruction.id, "instruction.finished");
                }
                if zero_time_advances >= cap {
                    warn!(target: "rover::engine", cap, "engine.zero_time_cap");
                    break;
                }
                zero_time_advances += 1;
                self.step_stack(bus, field);
                self.publish_debug();
                continue;
            }
            if budget <= epsilon {
                break;
            }
            let consumed = self.tick_current(budget, bus, field);
            budget -= consumed;
            if consumed > epsilon {
                zero_time_advances = 0;
            }
        }
        self.publish_debug();
    }

    pub fn debug_state(&self) -> DebugState {
        let top = self.frames.len().saturating_sub(1);
        let frames = self
            .frames
            .iter()
            .enumerate()
            .map(|(depth, frame)| {
                let last = frame.len.saturating_sub(1);
                let index = if depth == top {
                    frame.cursor.saturating_sub(1).min(last)
                } else {
                    frame.cursor.min(last)
                };
                DebugFrame {
                    kind: match frame.kind {
                        FrameKind::Sequence => DebugFrameKind::Sequence,
                        FrameKind::LoopForever | FrameKind::LoopCounted { .. } => DebugFrameKind::Loop,
                    },
                    index,
                    length: frame.len,
                }
            })
            .collect();
        DebugState {
            status: self.status,
            program: self.program.clone(),
            current_instruction: self.current.as_ref().map(|active| active.instruction.clone()),
            time_remaining: self.current.as_ref().map_or(0.0, |active| active.remaining.max(0.0)),
            frames,
        }
    }

    /// Registers a debug listener and immediately replays the current state to it.
    pub fn subscribe_debug(
        &mut self,
        mut listener: impl FnMut(&DebugState) + Send + Sync + 'static,
    ) -> ListenerId {
        listener(&self.debug_state());
        let id = self.next_listener_id();
        self.debug_listeners.push((id, Box::new(listener)));
        id
    }

    /// Registers a status listener and immediately replays the current status.
    pub fn subscribe_status(
        &mut self,
        mut listener: impl FnMut(EngineStatus) + Send + Sync + 'static,
    ) -> ListenerId {
        listener(self.status);
        let id = self.next_listener_id();
        self.status_listeners.push((id, Box::new(listener)));
        id
    }

    pub fn debug_channel(&mut self) -> (ListenerId, Receiver<DebugState>) {
        let (sender, receiver) = unbounded();
        let id = self.subscribe_debug(move |state| {
            let _ = sender.send(state.clone());
        });
        (id, receiver)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.debug_listeners.len() + self.status_listeners.len();
        self.debug_listeners.retain(|(candidate, _)| *candidate != id);
        self.status_listeners.retain(|(candidate, _)| *candidate != id);
        before != self.debug_listeners.len() + self.status_listeners.len()
    }

    fn next_listener_id(&mut self) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        id
    }

    fn reset_substate(&mut self) {
        self.frames.clear();
        self.current = None;
        self.scan_memory = ScanMemory::default();
    }

    fn set_status(&mut self, status: EngineStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.notify_status();
    }

    fn notify_status(&mut self) {
        let status = self.status;
        for (_, listener) in self.status_listeners.iter_mut() {
            listener(status);
        }
    }

    fn publish_debug(&mut self) {
        if self.debug_listeners.is_empty() {
            return;
        }
        let state = self.debug_state();
        for (_, listener) in self.debug_listeners.iter_mut() {
            listener(&state);
        }
    }

    fn complete(&mut self, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        self.frames.clear();
        self.current = None;
        self.stop_movement(bus, field);
        debug!(target: "rover::engine", "program.completed");
        self.set_status(EngineStatus::Completed);
    }

    fn fail(&mut self, reason: &str, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        warn!(target: "rover::engine", reason, "engine.stack_inconsistent");
        self.frames.clear();
        self.current = None;
        self.stop_movement(bus, field);
        self.set_status(EngineStatus::Error);
    }

    /// One stack-machine step: unwinds a finished frame, pushes a loop or
    /// branch body, or activates the next timed instruction.
    fn step_stack(&mut self, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        let Some(program) = self.program.clone() else {
            self.complete(bus, field);
            return;
        };
        let Some(frame) = self.frames.last_mut() else {
            self.complete(bus, field);
            return;
        };

        if frame.cursor >= frame.len {
            match &mut frame.kind {
                FrameKind::LoopCounted { remaining } => {
                    *remaining = remaining.saturating_sub(1);
                    if *remaining > 0 {
                        frame.cursor = 0;
                    } else {
                        self.frames.pop();
                    }
                }
                FrameKind::LoopForever => frame.cursor = 0,
                FrameKind::Sequence => {
                    self.frames.pop();
                }
            }
            if self.frames.is_empty() {
                self.complete(bus, field);
            }
            return;
        }

        let index = frame.cursor;
        frame.cursor += 1;
        let path = frame.path.clone();

        let Some(instruction) = resolve_body(&program, &path).and_then(|body| body.get(index)) else {
            self.fail("frame path no longer resolves", bus, field);
            return;
        };

        match &instruction.kind {
            InstructionKind::Loop { mode, body } => {
                if body.is_empty() {
                    return;
                }
                let kind = match mode {
                    LoopMode::Forever => FrameKind::LoopForever,
                    LoopMode::Counted { iterations } => {
                        let count = evaluate_number(iterations, &bus.telemetry());
                        let count = if count.is_finite() {
                            count.floor().clamp(0.0, u32::MAX as f64) as u32
                        } else {
                            0
                        };
                        if count == 0 {
                            return;
                        }
                        FrameKind::LoopCounted { remaining: count }
                    }
                };
                let mut body_path = path;
                body_path.push((index, Arm::Body));
                self.frames.push(Frame {
                    path: body_path,
                    len: body.len(),
                    cursor: 0,
                    kind,
                });
            }
            InstructionKind::Branch {
                condition,
                when_true,
                when_false,
            } => {
                let taken = evaluate_boolean(condition, &bus.telemetry());
                debug!(target: "rover::engine", instruction = %instruction.id, taken, "branch.evaluated");
                let (arm, body) = if taken {
                    (Arm::WhenTrue, when_true)
                } else {
                    (Arm::WhenFalse, when_false)
                };
                if body.is_empty() {
                    return;
                }
                let mut body_path = path;
                body_path.push((index, arm));
                self.frames.push(Frame {
                    path: body_path,
                    len: body.len(),
                    cursor: 0,
                    kind: FrameKind::Sequence,
                });
            }
            _ => self.activate(instruction.clone(), bus, field),
        }
    }

    fn activate(&mut self, instruction: BlockInstruction, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        let telemetry = bus.telemetry();
        let duration = instruction
            .kind
            .duration()
            .map(|binding| evaluate_number(binding, &telemetry))
            .unwrap_or(0.0);
        let duration = if duration.is_finite() && duration > 0.0 {
            duration as f32
        } else {
            0.0
        };
        debug!(
            target: "rover::engine",
            instruction = %instruction.id,
            kind = instruction.kind.name(),
            duration,
            "instruction.started"
        );

        let mut active = ActiveInstruction {
            instruction,
            remaining: duration,
            swing: None,
            finished: false,
        };

        match &active.instruction.kind {
            InstructionKind::Move { speed, .. } => {
                let speed = evaluate_number(speed, &telemetry) as f32;
                let heading = Vec2::from_angle(self.pose(&telemetry).orientation);
                self.set_velocity(heading * speed, 0.0, bus, field);
            }
            InstructionKind::MoveTo { speed, target, .. } => self.steer(speed, target, bus, field),
            InstructionKind::Turn { rate, .. } => {
                let rate = evaluate_number(rate, &telemetry) as f32;
                self.set_velocity(Vec2::ZERO, rate.to_radians(), bus, field);
            }
            InstructionKind::Wait { .. } => self.stop_movement(bus, field),
            InstructionKind::Scan { filter, .. } => {
                self.stop_movement(bus, field);
                let filter = filter.clone();
                self.scan(filter, bus, field);
            }
            InstructionKind::Gather { .. } => {
                self.stop_movement(bus, field);
                self.gather(&telemetry, bus, field);
            }
            InstructionKind::UseItem { slot, target, .. } => {
                self.stop_movement(bus, field);
                let slot = evaluate_number(slot, &telemetry);
                let slot = if slot.is_finite() { slot.floor().max(1.0) as u32 } else { 1 };
                match self.resolve_target(target, &telemetry, field) {
                    Some(resolved) if self.config.use_item.max_swings > 0 => {
                        let mut swing = SwingState {
                            slot,
                            node_id: resolved.node_id,
                            target: resolved.position,
                            swings_remaining: self.config.use_item.max_swings,
                            cooldown: None,
                        };
                        if !self.swing(&mut swing, bus, field) {
                            active.finished = true;
                        }
                        active.swing = Some(swing);
                    }
                    Some(_) => active.finished = true,
                    None => {
                        debug!(target: "rover::engine", instruction = %active.instruction.id, "use_item.no_target");
                        active.finished = true;
                    }
                }
            }
            InstructionKind::Deposit { .. } => {
                self.stop_movement(bus, field);
                self.invoke(ActionKind::StoreDefault, json!({}), bus, field);
            }
            InstructionKind::StoreStorage { request, .. } => {
                self.stop_movement(bus, field);
                let payload = storage_payload(request, &telemetry);
                self.invoke(ActionKind::StoreStorage, payload, bus, field);
            }
            InstructionKind::WithdrawStorage { request, .. } => {
                self.stop_movement(bus, field);
                let payload = storage_payload(request, &telemetry);
                self.invoke(ActionKind::WithdrawStorage, payload, bus, field);
            }
            InstructionKind::StatusToggle { .. } => {
                self.stop_movement(bus, field);
                self.invoke(ActionKind::ToggleStatus, json!({}), bus, field);
            }
            InstructionKind::StatusSet { value, .. } => {
                self.stop_movement(bus, field);
                let value = evaluate_boolean(value, &telemetry);
                self.invoke(ActionKind::SetStatus, json!({ "value": value }), bus, field);
            }
            InstructionKind::Loop { .. } | InstructionKind::Branch { .. } => {
                active.finished = true;
            }
        }

        self.current = Some(active);
    }

    /// Runs the active instruction for up to `budget` seconds and returns the
    /// time consumed. Sub-ticks end early at swing cooldown boundaries.
    fn tick_current(&mut self, budget: f32, bus: &mut dyn ActionBus, field: &mut ResourceField) -> f32 {
        let Some(mut active) = self.current.take() else {
            return 0.0;
        };
        let epsilon = self.config.timing.epsilon;

        let mut step = budget.min(active.remaining);
        if let Some(cooldown) = active.swing.as_ref().and_then(|swing| swing.cooldown) {
            step = step.min(cooldown.max(epsilon));
        }

        if let InstructionKind::MoveTo { speed, target, .. } = &active.instruction.kind {
            self.steer(speed, target, bus, field);
        }

        active.remaining -= step;

        if let Some(swing) = active.swing.as_mut() {
            if let Some(cooldown) = swing.cooldown.as_mut() {
                *cooldown -= step;
                if *cooldown <= epsilon {
                    swing.cooldown = None;
                    if !self.swing(swing, bus, field) {
                        active.finished = true;
                    }
                }
            }
        }

        self.current = Some(active);
        step
    }

    /// Fires one tool swing; returns whether the instruction keeps swinging.
    fn swing(&self, swing: &mut SwingState, bus: &mut dyn ActionBus, field: &mut ResourceField) -> bool {
        let mut payload = json!({
            "slot": swing.slot,
            "target": { "x": swing.target.x, "y": swing.target.y },
        });
        if let Some(node_id) = &swing.node_id {
            payload["nodeId"] = Value::String(node_id.clone());
        }
        let response = self.invoke(ActionKind::UseItem, payload, bus, field);
        let status = response
            .as_ref()
            .and_then(|value| value.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("missing-systems");
        swing.swings_remaining = swing.swings_remaining.saturating_sub(1);

        match status {
            "ok" if swing.swings_remaining > 0 => {
                swing.cooldown = Some(self.config.use_item.swing_interval);
                true
            }
            "ok" | "depleted" => false,
            other => {
                debug!(target: "rover::engine", status = other, "use_item.halted");
                false
            }
        }
    }

    fn scan(&mut self, filter: Option<String>, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        let response = self.invoke(ActionKind::Scan, json!({ "filter": filter }), bus, field);
        let result = response.and_then(|value| match serde_json::from_value::<ScanResult>(value) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(target: "rover::engine", error = %err, "scan.response_invalid");
                None
            }
        });
        self.scan_memory = match result {
            Some(result) => ScanMemory {
                filter: result.filter.or(filter),
                hits: result.hits,
            },
            None => ScanMemory { filter, hits: Vec::new() },
        };
        debug!(target: "rover::engine", hits = self.scan_memory.hits.len(), "scan.memory_replaced");
    }

    fn gather(&mut self, telemetry: &TelemetrySnapshot, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        let Some(node_id) = self.resolve_gather_node(telemetry, field) else {
            debug!(target: "rover::engine", "gather.no_node");
            return;
        };
        self.invoke(ActionKind::Gather, json!({ "nodeId": node_id }), bus, field);

        let live = field.get(&node_id).map_or(0.0, |node| node.quantity);
        for hit in self.scan_memory.hits.iter_mut().filter(|hit| hit.id == node_id) {
            hit.quantity = live;
        }
    }

    /// Live remembered hit, else the live node nearest any remembered hit,
    /// else the node nearest the agent.
    fn resolve_gather_node(&self, telemetry: &TelemetrySnapshot, field: &ResourceField) -> Option<String> {
        let live_hit = self
            .scan_memory
            .hits
            .iter()
            .find(|hit| field.get(&hit.id).is_some_and(|node| node.quantity > 0.0));
        if let Some(hit) = live_hit {
            return Some(hit.id.clone());
        }

        let filter = self.scan_memory.filter.as_deref();
        let remembered = self
            .scan_memory
            .hits
            .iter()
            .filter_map(|hit| {
                let node = field.nearest_node(hit.position, filter)?;
                Some((node, node.position.distance(hit.position)))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((node, _)) = remembered {
            return Some(node.id.clone());
        }

        field
            .nearest_node(self.pose(telemetry).position, filter)
            .map(|node| node.id.clone())
    }

    fn resolve_target(
        &self,
        target: &TargetBinding,
        telemetry: &TelemetrySnapshot,
        field: &ResourceField,
    ) -> Option<ResolvedTarget> {
        if target.use_scan_hit && !self.scan_memory.hits.is_empty() {
            let hits = &self.scan_memory.hits;
            let index = evaluate_number(&target.scan_hit_index, telemetry);
            let index = if index.is_finite() { index.floor().max(1.0) as usize } else { 1 };
            let hit = &hits[index.min(hits.len()) - 1];
            let live = field
                .get(&hit.id)
                .filter(|node| node.quantity > 0.0)
                .or_else(|| field.nearest_node(hit.position, None));
            if let Some(node) = live {
                return Some(ResolvedTarget {
                    node_id: Some(node.id.clone()),
                    position: node.position,
                });
            }
        }

        let point = target.position.filter(|point| point.is_finite())?;
        let position = Vec2::new(point.x, point.y);
        Some(ResolvedTarget {
            node_id: field.nearest_node(position, None).map(|node| node.id.clone()),
            position,
        })
    }

    fn steer(
        &self,
        speed: &NumberBinding,
        target: &TargetBinding,
        bus: &mut dyn ActionBus,
        field: &mut ResourceField,
    ) {
        let telemetry = bus.telemetry();
        let speed = evaluate_number(speed, &telemetry) as f32;
        let command = match self.resolve_target(target, &telemetry, field) {
            Some(resolved) => self
                .navigator
                .steer_towards(self.pose(&telemetry), resolved.position, speed),
            None => SteeringCommand::IDLE,
        };
        self.set_velocity(command.linear_velocity, command.angular_velocity, bus, field);
    }

    fn pose(&self, telemetry: &TelemetrySnapshot) -> Pose {
        let signals = &self.config.telemetry;
        Pose {
            position: telemetry
                .vector(&signals.movement_module, &signals.position_signal)
                .unwrap_or(Vec2::ZERO),
            orientation: telemetry
                .number(&signals.movement_module, &signals.orientation_signal)
                .unwrap_or(0.0) as f32,
        }
    }

    fn stop_movement(&self, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        self.set_velocity(Vec2::ZERO, 0.0, bus, field);
    }

    fn set_velocity(&self, linear: Vec2, angular: f32, bus: &mut dyn ActionBus, field: &mut ResourceField) {
        self.invoke(
            ActionKind::SetLinearVelocity,
            json!({ "x": linear.x, "y": linear.y }),
            bus,
            field,
        );
        self.invoke(ActionKind::SetAngularVelocity, json!({ "value": angular }), bus, field);
    }

    /// Routes an action to the first registered module providing it.
    fn invoke(
        &self,
        action: ActionKind,
        payload: Value,
        bus: &mut dyn ActionBus,
        field: &mut ResourceField,
    ) -> Option<Value> {
        let Some(module) = self.registry.provider(action) else {
            debug!(target: "rover::engine", %action, "action.no_provider");
            return None;
        };
        let response = bus.invoke_action(&module.id, action.action_name(), payload, field);
        if response.is_none() {
            debug!(target: "rover::engine", module = %module.id, %action, "action.module_absent");
        }
        response
    }
}

fn resolve_body<'a>(program: &'a CompiledProgram, path: &[(usize, Arm)]) -> Option<&'a [BlockInstruction]> {
    let mut body: &[BlockInstruction] = &program.instructions;
    for (index, arm) in path {
        body = match (&body.get(*index)?.kind, arm) {
            (InstructionKind::Loop { body, .. }, Arm::Body) => body,
            (InstructionKind::Branch { when_true, .. }, Arm::WhenTrue) => when_true,
            (InstructionKind::Branch { when_false, .. }, Arm::WhenFalse) => when_false,
            _ => return None,
        };
    }
    Some(body)
}

fn storage_payload(request: &StorageRequest, telemetry: &TelemetrySnapshot) -> Value {
    let mut payload = Map::new();
    if let Some(box_id) = &request.box_id {
        payload.insert("boxId".into(), Value::String(box_id.clone()));
    }
    if let Some(resource_id) = &request.resource_id {
        payload.insert("resourceId".into(), Value::String(resource_id.clone()));
    }
    if let Some(amount) = &request.amount {
        let amount = evaluate_number(amount, telemetry);
        if amount > 0.0 {
            payload.insert("amount".into(), json!(amount));
        }
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_field::{HarvestOptions, UpsertNodeOptions};
    use crate::telemetry::{RecordingBus, SignalValue};
    use program_runtime::{
        BooleanBinding, Expression, Point, SignalRef, ValueKind,
    };
    use std::sync::Mutex;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(ModuleRegistry::standard().shared(), Arc::new(EngineConfig::default()))
    }

    fn timed(id: &str, kind: InstructionKind) -> BlockInstruction {
        BlockInstruction::new(id, format!("block-{id}"), kind)
    }

    fn toggle(id: &str) -> BlockInstruction {
        timed(
            id,
            InstructionKind::StatusToggle {
                duration: NumberBinding::literal(0.0),
            },
        )
    }

    fn wait(id: &str, seconds: f64) -> BlockInstruction {
        timed(
            id,
            InstructionKind::Wait {
                duration: NumberBinding::literal(seconds),
            },
        )
    }

    fn counted(id: &str, iterations: f64, body: Vec<BlockInstruction>) -> BlockInstruction {
        timed(
            id,
            InstructionKind::Loop {
                mode: LoopMode::Counted {
                    iterations: NumberBinding::literal(iterations),
                },
                body,
            },
        )
    }

    fn forever(id: &str, body: Vec<BlockInstruction>) -> BlockInstruction {
        timed(
            id,
            InstructionKind::Loop {
                mode: LoopMode::Forever,
                body,
            },
        )
    }

    fn use_item(id: &str, duration: f64, target: TargetBinding) -> BlockInstruction {
        timed(
            id,
            InstructionKind::UseItem {
                duration: NumberBinding::literal(duration),
                slot: NumberBinding::literal(1.0),
                target,
            },
        )
    }

    #[test]
    fn empty_program_completes_on_load_and_stops_movement() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        engine.load(CompiledProgram::default(), &mut bus, &mut field);

        assert_eq!(engine.status(), EngineStatus::Completed);
        assert_eq!(
            bus.last_call("setLinearVelocity").map(|call| call.payload.clone()),
            Some(json!({ "x": 0.0, "y": 0.0 }))
        );
        assert_eq!(
            bus.last_call("setAngularVelocity").map(|call| call.payload.clone()),
            Some(json!({ "value": 0.0 }))
        );
    }

    #[test]
    fn move_runs_for_its_duration_then_completes() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        let program = CompiledProgram::new(vec![timed(
            "move",
            InstructionKind::Move {
                duration: NumberBinding::literal(1.0),
                speed: NumberBinding::literal(40.0),
            },
        )]);
        engine.load(program, &mut bus, &mut field);

        engine.update(0.5, &mut bus, &mut field);
        assert_eq!(engine.status(), EngineStatus::Running);
        assert_eq!(
            bus.last_call("setLinearVelocity").map(|call| call.payload.clone()),
            Some(json!({ "x": 40.0, "y": 0.0 }))
        );

        engine.update(0.6, &mut bus, &mut field);
        assert_eq!(engine.status(), EngineStatus::Completed);
        assert_eq!(
            bus.last_call("setLinearVelocity").map(|call| call.payload.clone()),
            Some(json!({ "x": 0.0, "y": 0.0 }))
        );
    }

    #[test]
    fn move_follows_reported_orientation() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        bus.set_signal(
            "core.movement",
            "orientation",
            SignalValue::Number(std::f64::consts::FRAC_PI_2),
        );
        let mut field = ResourceField::new();
        let program = CompiledProgram::new(vec![timed(
            "move",
            InstructionKind::Move {
                duration: NumberBinding::literal(1.0),
                speed: NumberBinding::literal(10.0),
            },
        )]);
        engine.load(program, &mut bus, &mut field);
        engine.update(0.1, &mut bus, &mut field);

        let payload = &bus.last_call("setLinearVelocity").expect("velocity issued").payload;
        assert!(payload["x"].as_f64().unwrap().abs() < 1e-3);
        assert!((payload["y"].as_f64().unwrap() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn turn_issues_radians_per_second() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        let program = CompiledProgram::new(vec![timed(
            "turn",
            InstructionKind::Turn {
                duration: NumberBinding::literal(1.0),
                rate: NumberBinding::literal(90.0),
            },
        )]);
        engine.load(program, &mut bus, &mut field);
        engine.update(0.1, &mut bus, &mut field);
        let rate = bus.last_call("setAngularVelocity").unwrap().payload["value"]
            .as_f64()
            .unwrap();
        assert!((rate - std::f64::consts::FRAC_PI_2).abs() < 1e-4);
    }

    #[test]
    fn counted_loops_run_exact_iterations_and_skip_non_positive_counts() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        let program = CompiledProgram::new(vec![
            counted("never", -2.0, vec![toggle("a")]),
            counted("zero", 0.0, vec![toggle("b")]),
            counted("thrice", 3.4, vec![toggle("c")]),
        ]);
        engine.load(program, &mut bus, &mut field);
        engine.update(0.0, &mut bus, &mut field);

        assert_eq!(engine.status(), EngineStatus::Completed);
        assert_eq!(bus.calls_to("toggleStatus").len(), 3);
    }

    #[test]
    fn instant_forever_loop_is_bounded_per_update() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        engine.load(
            CompiledProgram::new(vec![forever("loop", vec![toggle("t")])]),
            &mut bus,
            &mut field,
        );

        engine.update(1.0, &mut bus, &mut field);
        let first = bus.calls_to("toggleStatus").len();
        assert!(first > 0);
        assert!(first <= 256);
        assert_eq!(engine.status(), EngineStatus::Running);

        engine.update(1.0, &mut bus, &mut field);
        assert!(bus.calls_to("toggleStatus").len() <= 512);
    }

    #[test]
    fn empty_loop_bodies_exhaust_immediately() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        engine.load(
            CompiledProgram::new(vec![forever("empty", Vec::new()), counted("also", 5.0, Vec::new())]),
            &mut bus,
            &mut field,
        );
        engine.update(0.1, &mut bus, &mut field);
        assert_eq!(engine.status(), EngineStatus::Completed);
    }

    #[test]
    fn branch_follows_signal_between_loads() {
        let active = SignalRef::new("status.control", "active", ValueKind::Boolean);
        let program = CompiledProgram::new(vec![timed(
            "branch",
            InstructionKind::Branch {
                condition: BooleanBinding::with_expression(false, Expression::signal(active, None)),
                when_true: vec![timed(
                    "off",
                    InstructionKind::StatusSet {
                        duration: NumberBinding::literal(0.0),
                        value: BooleanBinding::literal(false),
                    },
                )],
                when_false: vec![timed(
                    "on",
                    InstructionKind::StatusSet {
                        duration: NumberBinding::literal(0.0),
                        value: BooleanBinding::literal(true),
                    },
                )],
            },
        )]);
        let program = Arc::new(program);
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();

        bus.set_signal("status.control", "active", SignalValue::Boolean(true));
        engine.load(Arc::clone(&program), &mut bus, &mut field);
        engine.update(0.1, &mut bus, &mut field);
        assert_eq!(
            bus.last_call("setStatus").map(|call| call.payload.clone()),
            Some(json!({ "value": false }))
        );

        bus.set_signal("status.control", "active", SignalValue::Boolean(false));
        engine.load(program, &mut bus, &mut field);
        engine.update(0.1, &mut bus, &mut field);
        assert_eq!(
            bus.last_call("setStatus").map(|call| call.payload.clone()),
            Some(json!({ "value": true }))
        );
    }

    #[test]
    fn use_item_swings_on_interval_until_depleted() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        bus.respond("inventory.core", "useItem", json!({ "status": "ok" }));
        bus.respond("inventory.core", "useItem", json!({ "status": "ok" }));
        bus.respond("inventory.core", "useItem", json!({ "status": "depleted" }));
        let mut field = ResourceField::new();
        field
            .upsert_node(UpsertNodeOptions::new("tree", Vec2::new(5.0, 0.0), 3.0).with_id("oak"))
            .unwrap();

        let program = CompiledProgram::new(vec![
            use_item("chop", 3.0, TargetBinding::position(Point::new(5.0, 0.0))),
            wait("after", 10.0),
        ]);
        engine.load(program, &mut bus, &mut field);

        engine.update(0.5, &mut bus, &mut field);
        assert_eq!(bus.calls_to("useItem").len(), 1);
        assert_eq!(bus.calls_to("useItem")[0].payload["nodeId"], json!("oak"));

        engine.update(0.8, &mut bus, &mut field);
        assert_eq!(bus.calls_to("useItem").len(), 3);
        assert_eq!(engine.current_instruction().map(|i| i.id.as_str()), Some("after"));
    }

    #[test]
    fn use_item_halts_on_terminal_status() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        bus.respond("inventory.core", "useItem", json!({ "status": "invalid-slot" }));
        let mut field = ResourceField::new();
        engine.load(
            CompiledProgram::new(vec![use_item(
                "chop",
                3.0,
                TargetBinding::position(Point::new(1.0, 1.0)),
            )]),
            &mut bus,
            &mut field,
        );
        engine.update(2.0, &mut bus, &mut field);
        assert_eq!(bus.calls_to("useItem").len(), 1);
        assert_eq!(engine.status(), EngineStatus::Completed);
    }

    #[test]
    fn use_item_without_target_ends_without_calling_the_bus() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        engine.load(
            CompiledProgram::new(vec![use_item("chop", 3.0, TargetBinding::scan_hit(1))]),
            &mut bus,
            &mut field,
        );
        engine.update(0.1, &mut bus, &mut field);
        assert!(bus.calls_to("useItem").is_empty());
        assert_eq!(engine.status(), EngineStatus::Completed);
    }

    #[test]
    fn scan_replaces_memory_and_stop_discards_it() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        bus.respond(
            "sensor.scanner",
            "scan",
            json!({
                "filter": "ore",
                "hits": [ { "id": "ore-1", "type": "ore", "quantity": 2.0, "distance": 3.0, "position": [3.0, 0.0] } ],
                "total": 1
            }),
        );
        let mut field = ResourceField::new();
        engine.load(
            CompiledProgram::new(vec![
                timed(
                    "scan",
                    InstructionKind::Scan {
                        duration: NumberBinding::literal(1.0),
                        filter: Some("ore".into()),
                    },
                ),
                wait("hold", 5.0),
            ]),
            &mut bus,
            &mut field,
        );
        engine.update(0.1, &mut bus, &mut field);
        assert_eq!(bus.last_call("scan").unwrap().payload, json!({ "filter": "ore" }));
        assert_eq!(engine.scan_memory().hits.len(), 1);
        assert_eq!(engine.scan_memory().filter.as_deref(), Some("ore"));

        engine.stop(&mut bus, &mut field);
        assert_eq!(engine.status(), EngineStatus::Idle);
        assert!(engine.scan_memory().hits.is_empty());
        assert!(engine.current_instruction().is_none());
    }

    #[test]
    fn gather_targets_nearest_node_and_skips_empty_field() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        let gather = timed(
            "gather",
            InstructionKind::Gather {
                duration: NumberBinding::literal(0.0),
            },
        );
        engine.load(CompiledProgram::new(vec![gather.clone()]), &mut bus, &mut field);
        engine.update(0.1, &mut bus, &mut field);
        assert!(bus.calls_to("gather").is_empty());

        field
            .upsert_node(UpsertNodeOptions::new("ore", Vec2::new(50.0, 0.0), 2.0).with_id("far"))
            .unwrap();
        field
            .upsert_node(UpsertNodeOptions::new("ore", Vec2::new(5.0, 0.0), 2.0).with_id("near"))
            .unwrap();
        engine.load(CompiledProgram::new(vec![gather]), &mut bus, &mut field);
        engine.update(0.1, &mut bus, &mut field);
        assert_eq!(bus.last_call("gather").unwrap().payload, json!({ "nodeId": "near" }));
    }

    /// Scan memory remembers `a`, which is then emptied. `b` sits closest to
    /// the remembered position while `c` sits closest to the agent.
    fn field_after_remembered_node_empties(bus: &mut RecordingBus) -> ResourceField {
        bus.respond(
            "sensor.scanner",
            "scan",
            json!({
                "filter": "ore",
                "hits": [ { "id": "a", "type": "ore", "quantity": 1.0, "distance": 10.0, "position": [10.0, 0.0] } ],
                "total": 1
            }),
        );
        let mut field = ResourceField::new();
        for (id, position, quantity) in [
            ("a", Vec2::new(10.0, 0.0), 1.0),
            ("b", Vec2::new(14.0, 3.0), 2.0),
            ("c", Vec2::new(2.0, 0.0), 2.0),
        ] {
            field
                .upsert_node(UpsertNodeOptions::new("ore", position, quantity).with_id(id))
                .unwrap();
        }
        field
    }

    fn scan_ore(id: &str) -> BlockInstruction {
        timed(
            id,
            InstructionKind::Scan {
                duration: NumberBinding::literal(0.1),
                filter: Some("ore".into()),
            },
        )
    }

    #[test]
    fn gather_falls_back_to_node_nearest_remembered_hit() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = field_after_remembered_node_empties(&mut bus);
        engine.load(
            CompiledProgram::new(vec![
                scan_ore("scan"),
                timed(
                    "gather",
                    InstructionKind::Gather {
                        duration: NumberBinding::literal(0.0),
                    },
                ),
            ]),
            &mut bus,
            &mut field,
        );
        engine.update(0.05, &mut bus, &mut field);
        field.harvest(HarvestOptions::new("a", 1.0));
        engine.update(0.5, &mut bus, &mut field);

        assert_eq!(bus.last_call("gather").unwrap().payload, json!({ "nodeId": "b" }));
        assert_eq!(engine.status(), EngineStatus::Completed);
    }

    #[test]
    fn depleted_scan_hit_retargets_to_nearest_live_node() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = field_after_remembered_node_empties(&mut bus);
        engine.load(
            CompiledProgram::new(vec![
                scan_ore("scan"),
                timed(
                    "approach",
                    InstructionKind::MoveTo {
                        duration: NumberBinding::literal(1.0),
                        speed: NumberBinding::literal(10.0),
                        target: TargetBinding::scan_hit(1),
                    },
                ),
                use_item("chop", 1.0, TargetBinding::scan_hit(1)),
            ]),
            &mut bus,
            &mut field,
        );
        engine.update(0.05, &mut bus, &mut field);
        field.harvest(HarvestOptions::new("a", 1.0));
        engine.update(0.5, &mut bus, &mut field);

        let velocity = &bus.last_call("setLinearVelocity").unwrap().payload;
        let (x, y) = (velocity["x"].as_f64().unwrap(), velocity["y"].as_f64().unwrap());
        assert!(x > 0.0);
        assert!((y / x - 3.0 / 14.0).abs() < 1e-3, "steering {x},{y} does not face b");

        engine.update(1.0, &mut bus, &mut field);
        let swing = &bus.last_call("useItem").unwrap().payload;
        assert_eq!(swing["nodeId"], "b");
        assert_eq!(swing["target"], json!({ "x": 14.0, "y": 3.0 }));
    }

    #[test]
    fn absent_modules_are_tolerated() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        bus.mark_absent("storage.link");
        let mut field = ResourceField::new();
        engine.load(
            CompiledProgram::new(vec![
                timed(
                    "store",
                    InstructionKind::StoreStorage {
                        duration: NumberBinding::literal(0.5),
                        request: StorageRequest::default(),
                    },
                ),
                toggle("after"),
            ]),
            &mut bus,
            &mut field,
        );
        engine.update(1.0, &mut bus, &mut field);
        assert_eq!(engine.status(), EngineStatus::Completed);
        assert_eq!(bus.calls_to("toggleStatus").len(), 1);
    }

    #[test]
    fn debug_state_tracks_frames_and_replays_on_subscribe() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        engine.load(
            CompiledProgram::new(vec![
                wait("first", 1.0),
                counted("loop", 2.0, vec![wait("a", 1.0), wait("b", 1.0)]),
            ]),
            &mut bus,
            &mut field,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = engine.subscribe_debug(move |state| sink.lock().unwrap().push(state.status));
        assert_eq!(*seen.lock().unwrap(), vec![EngineStatus::Running]);

        engine.update(1.5, &mut bus, &mut field);
        let state = engine.debug_state();
        assert_eq!(state.current_instruction.as_ref().map(|i| i.id.as_str()), Some("a"));
        assert!((state.time_remaining - 0.5).abs() < 1e-4);
        assert_eq!(
            state.frames,
            vec![
                DebugFrame {
                    kind: DebugFrameKind::Sequence,
                    index: 1,
                    length: 2
                },
                DebugFrame {
                    kind: DebugFrameKind::Loop,
                    index: 0,
                    length: 2
                },
            ]
        );

        let (_channel_id, receiver) = engine.debug_channel();
        assert_eq!(receiver.try_recv().map(|state| state.status), Ok(EngineStatus::Running));

        assert!(engine.unsubscribe(id));
        let delivered = seen.lock().unwrap().len();
        engine.update(10.0, &mut bus, &mut field);
        assert_eq!(seen.lock().unwrap().len(), delivered);
        assert_eq!(engine.status(), EngineStatus::Completed);
        assert_eq!(
            receiver.try_iter().last().map(|state| state.status),
            Some(EngineStatus::Completed)
        );
    }

    #[test]
    fn status_listener_sees_transitions() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.subscribe_status(move |status| sink.lock().unwrap().push(status));

        engine.load(CompiledProgram::new(vec![wait("w", 1.0)]), &mut bus, &mut field);
        engine.update(2.0, &mut bus, &mut field);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EngineStatus::Idle, EngineStatus::Running, EngineStatus::Completed]
        );
    }

    #[test]
    fn reloading_while_running_announces_restart() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.load(CompiledProgram::new(vec![wait("w", 5.0)]), &mut bus, &mut field);
        engine.subscribe_status(move |status| sink.lock().unwrap().push(status));
        engine.update(1.0, &mut bus, &mut field);

        engine.load(CompiledProgram::new(vec![wait("w", 5.0)]), &mut bus, &mut field);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EngineStatus::Running, EngineStatus::Running]
        );
        assert!(engine.current_instruction().is_none());
    }

    #[test]
    fn update_is_inert_unless_running() {
        let mut engine = engine();
        let mut bus = RecordingBus::new();
        let mut field = ResourceField::new();
        engine.update(1.0, &mut bus, &mut field);
        assert_eq!(engine.status(), EngineStatus::Idle);
        assert!(bus.calls().is_empty());
    }
}
