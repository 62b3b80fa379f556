#![allow(dead_code)]

use std::path::PathBuf;

use agent_core::{
    ActionBus, EngineConfig, ExecutionEngine, FieldLayout, ResourceField, SimulatedAgent,
    TelemetrySnapshot,
};
use bevy::math::Vec2;
use program_runtime::{
    BlockInstance, CompileOptions, CompileResult, ModuleRegistry, ParameterValue,
    ProgramCompiler,
};
use serde_json::Value;
use std::sync::Arc;

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn load_layout(name: &str) -> anyhow::Result<FieldLayout> {
    Ok(FieldLayout::from_file(&fixture(name))?)
}

pub fn start(children: Vec<BlockInstance>) -> BlockInstance {
    BlockInstance::new("trigger", "start").with_slot("do", children)
}

pub fn block(instance_id: &str, block_id: &str) -> BlockInstance {
    BlockInstance::new(instance_id, block_id)
}

pub fn num(value: f64) -> ParameterValue {
    ParameterValue::Number(value)
}

pub fn compile(blocks: &[BlockInstance]) -> CompileResult {
    ProgramCompiler::new(ModuleRegistry::standard().shared()).compile(blocks)
}

pub fn compile_with(blocks: &[BlockInstance], options: CompileOptions) -> CompileResult {
    ProgramCompiler::new(ModuleRegistry::standard().shared())
        .with_options(options)
        .compile(blocks)
}

/// Engine, reference agent and field driven together one step at a time.
pub struct Rig {
    pub engine: ExecutionEngine,
    pub agent: SimulatedAgent,
    pub field: ResourceField,
    pub counts: ActionCounts,
}

#[derive(Debug, Default, Clone)]
pub struct ActionCounts {
    pub calls: Vec<String>,
}

impl ActionCounts {
    pub fn count(&self, action: &str) -> usize {
        self.calls.iter().filter(|call| call.as_str() == action).count()
    }
}

struct CountingBus<'a> {
    inner: &'a mut SimulatedAgent,
    counts: &'a mut ActionCounts,
}

impl ActionBus for CountingBus<'_> {
    fn invoke_action(
        &mut self,
        module_id: &str,
        action: &str,
        payload: Value,
        field: &mut ResourceField,
    ) -> Option<Value> {
        self.counts.calls.push(action.to_string());
        self.inner.invoke_action(module_id, action, payload, field)
    }

    fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.telemetry()
    }
}

impl Rig {
    pub fn new(position: Vec2) -> Self {
        agent_core::logging::init();
        let config = Arc::new(EngineConfig::default());
        let registry = ModuleRegistry::standard().shared();
        let agent = SimulatedAgent::new(position, &registry, &config.agent, &config.field);
        Self {
            engine: ExecutionEngine::new(registry, config),
            agent,
            field: ResourceField::new(),
            counts: ActionCounts::default(),
        }
    }

    pub fn load_blocks(&mut self, blocks: &[BlockInstance]) -> CompileResult {
        let result = compile(blocks);
        self.load(result.program.clone());
        result
    }

    pub fn load(&mut self, program: program_runtime::CompiledProgram) {
        let mut bus = CountingBus {
            inner: &mut self.agent,
            counts: &mut self.counts,
        };
        self.engine.load(program, &mut bus, &mut self.field);
    }

    /// Advances the program, then integrates the agent over the same step.
    pub fn tick(&mut self, dt: f32) {
        let mut bus = CountingBus {
            inner: &mut self.agent,
            counts: &mut self.counts,
        };
        self.engine.update(dt, &mut bus, &mut self.field);
        self.agent.step(dt);
    }

    pub fn run(&mut self, ticks: usize, dt: f32) {
        for _ in 0..ticks {
            self.tick(dt);
        }
    }
}
