use std::sync::Arc;

use bevy::math::Vec2;
use bevy::prelude::Resource;
use program_runtime::{CompiledProgram, ModuleRegistry};
use serde::{Deserialize, Serialize};

use crate::agent::SimulatedAgent;
use crate::config::EngineConfig;
use crate::engine::ExecutionEngine;
use crate::resource_field::ResourceField;

/// Fixed program clock for the headless host.
#[derive(Resource, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seconds of program time consumed per tick.
    pub delta_seconds: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { delta_seconds: 0.1 }
    }
}

/// Tracks total simulation ticks elapsed.
#[derive(Resource, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationTick(pub u64);

/// One agent with its own interpreter and module set.
#[derive(Debug)]
pub struct AgentSlot {
    pub name: String,
    pub engine: ExecutionEngine,
    pub agent: SimulatedAgent,
}

impl AgentSlot {
    pub fn load(&mut self, program: impl Into<Arc<CompiledProgram>>, field: &mut ResourceField) {
        self.engine.load(program, &mut self.agent, field);
    }

    pub fn stop(&mut self, field: &mut ResourceField) {
        self.engine.stop(&mut self.agent, field);
    }
}

/// Every agent hosted by the app, advanced in insertion order.
#[derive(Resource, Debug, Default)]
pub struct AgentPrograms {
    slots: Vec<AgentSlot>,
}

impl AgentPrograms {
    /// Adds an agent; a slot with the same name is replaced.
    pub fn spawn(
        &mut self,
        name: impl Into<String>,
        position: Vec2,
        registry: Arc<ModuleRegistry>,
        config: Arc<EngineConfig>,
    ) -> &mut AgentSlot {
        let name = name.into();
        let agent = SimulatedAgent::new(position, &registry, &config.agent, &config.field);
        let slot = AgentSlot {
            name: name.clone(),
            engine: ExecutionEngine::new(registry, config),
            agent,
        };
        let index = match self.slots.iter().position(|slot| slot.name == name) {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        &mut self.slots[index]
    }

    pub fn get(&self, name: &str) -> Option<&AgentSlot> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AgentSlot> {
        self.slots.iter_mut().find(|slot| slot.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AgentSlot> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
