use bevy::prelude::*;

use crate::resource_field::ResourceField;
use crate::resources::{AgentPrograms, SimulationConfig, SimulationTick};

/// Runs every agent's interpreter for one tick of program time.
pub fn advance_programs(
    mut programs: ResMut<AgentPrograms>,
    mut field: ResMut<ResourceField>,
    config: Res<SimulationConfig>,
) {
    let dt = config.delta_seconds;
    for slot in programs.iter_mut() {
        slot.engine.update(dt, &mut slot.agent, &mut field);
    }
}

/// Moves agents along the velocities their programs commanded.
pub fn integrate_agents(mut programs: ResMut<AgentPrograms>, config: Res<SimulationConfig>) {
    let dt = config.delta_seconds;
    for slot in programs.iter_mut() {
        slot.agent.step(dt);
    }
}

pub fn advance_tick(mut tick: ResMut<SimulationTick>) {
    tick.0 += 1;
}
