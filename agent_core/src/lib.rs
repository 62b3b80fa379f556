//! Rover runtime: the resource field, the block-program interpreter and a
//! headless Bevy host that drives both one fixed tick at a time via
//! [`run_tick`].

pub mod agent;
pub mod binding;
pub mod config;
pub mod diagnostic_stream;
pub mod engine;
pub mod layout;
pub mod logging;
pub mod navigator;
pub mod resource_field;
mod resources;
mod systems;
pub mod telemetry;

use std::sync::Arc;

use bevy::prelude::*;
use program_runtime::{CompiledProgram, ModuleRegistry};

pub use agent::{AgentSummary, SimulatedAgent};
pub use config::{
    load_engine_config_from_env, EngineConfig, EngineConfigError, EngineConfigHandle,
};
pub use diagnostic_stream::{DiagnosticForwardLayer, LogEnvelope};
pub use engine::{DebugFrame, DebugFrameKind, DebugState, EngineStatus, ExecutionEngine, ScanMemory};
pub use layout::{ClusterSpec, FieldLayout, LayoutError, QuantityBand};
pub use navigator::{Navigator, NavigatorConfig, Pose, SteeringCommand};
pub use resource_field::{
    FieldEventKind, HarvestOptions, HarvestResult, HarvestStatus, HitOptions, HitResult,
    HitStatus, ListenerId, NodeDrop, NodeMetadata, ResourceField, ResourceFieldError,
    ResourceFieldEvent, ResourceNode, ScanHit, ScanOptions, ScanResult, UpsertNodeOptions,
};
pub use resources::{AgentPrograms, AgentSlot, SimulationConfig, SimulationTick};
pub use telemetry::{ActionBus, ActionCall, RecordingBus, SignalSample, SignalValue, TelemetrySnapshot};

/// Registry every hosted agent shares.
#[derive(Resource, Debug, Clone)]
pub struct ModuleRegistryHandle(pub Arc<ModuleRegistry>);

/// Construct a Bevy [`App`] hosting agents that run block programs against a
/// shared resource field.
pub fn build_headless_app() -> App {
    let (engine_config, _path) = load_engine_config_from_env();
    build_headless_app_with(engine_config, SimulationConfig::default())
}

pub fn build_headless_app_with(engine_config: Arc<EngineConfig>, simulation: SimulationConfig) -> App {
    let mut app = App::new();

    app.insert_resource(simulation)
        .insert_resource(SimulationTick::default())
        .insert_resource(EngineConfigHandle::new(engine_config))
        .insert_resource(ModuleRegistryHandle(ModuleRegistry::standard().shared()))
        .insert_resource(ResourceField::new())
        .insert_resource(AgentPrograms::default())
        .add_plugins(MinimalPlugins)
        .add_systems(
            Update,
            (
                systems::advance_programs,
                systems::integrate_agents,
                systems::advance_tick,
            )
                .chain(),
        );

    app
}

/// Execute a single simulation tick.
///
/// Each call runs the chained systems configured in [`build_headless_app`]
/// (program advance → agent integration → tick increment).
pub fn run_tick(app: &mut App) {
    app.update();
}

/// Adds an agent using the app's registry and engine config.
pub fn spawn_agent(app: &mut App, name: &str, position: Vec2) {
    let registry = app.world.resource::<ModuleRegistryHandle>().0.clone();
    let config = app.world.resource::<EngineConfigHandle>().get();
    app.world
        .resource_mut::<AgentPrograms>()
        .spawn(name, position, registry, config);
}

/// Loads `program` into the named agent; returns `false` for unknown agents.
pub fn load_program(app: &mut App, name: &str, program: impl Into<Arc<CompiledProgram>>) -> bool {
    let program = program.into();
    app.world.resource_scope(|world, mut programs: Mut<AgentPrograms>| {
        let mut field = world.resource_mut::<ResourceField>();
        match programs.get_mut(name) {
            Some(slot) => {
                slot.load(program, &mut field);
                true
            }
            None => false,
        }
    })
}
