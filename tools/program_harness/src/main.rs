use std::{path::PathBuf, sync::Arc};

use agent_core::{
    build_headless_app_with, load_engine_config_from_env, load_program, logging, run_tick,
    spawn_agent, AgentPrograms, EngineConfig, EngineStatus, FieldLayout, ResourceField,
    SimulationConfig,
};
use anyhow::{Context, Result};
use bevy::math::Vec2;
use clap::{Parser, ValueEnum};
use program_runtime::{
    load_workspace, workspace_schema, CompileOptions, InstructionFormat, ModuleRegistry,
    ProgramCompiler,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compile a block workspace and run it headless", long_about = None)]
struct Args {
    /// Path to the workspace JSON file
    #[arg(long, required_unless_present = "schema")]
    workspace: Option<PathBuf>,

    /// Field layout JSON used to seed resource nodes
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Engine config JSON (defaults to ROVER_ENGINE_CONFIG_PATH or the builtin)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of ticks to run
    #[arg(long, default_value_t = 100)]
    ticks: u32,

    /// Program seconds per tick
    #[arg(long, default_value_t = 0.1)]
    delta: f32,

    /// Starting position as x,y
    #[arg(long, value_parser = parse_position, default_value = "0,0")]
    start: Vec2,

    #[arg(long, value_enum, default_value_t = Format::Expression)]
    format: Format,

    /// Echo runtime warnings after each tick
    #[arg(long)]
    echo_diagnostics: bool,

    /// Print the workspace JSON schema and exit
    #[arg(long)]
    schema: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Format {
    Literal,
    Expression,
}

const AGENT: &str = "rover";

fn main() -> Result<()> {
    let args = Args::parse();
    let diagnostics = if args.echo_diagnostics {
        Some(logging::init_with_diagnostics())
    } else {
        logging::init();
        None
    };

    if args.schema {
        println!("{}", serde_json::to_string_pretty(&workspace_schema())?);
        return Ok(());
    }
    let workspace_path = args
        .workspace
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--workspace is required"))?;

    let config = match &args.config {
        Some(path) => Arc::new(
            EngineConfig::from_file(path)
                .with_context(|| format!("Failed to load engine config {}", path.display()))?,
        ),
        None => load_engine_config_from_env().0,
    };

    let workspace = load_workspace(workspace_path)
        .with_context(|| format!("Failed to load workspace {}", workspace_path.display()))?;
    let format = match args.format {
        Format::Literal => InstructionFormat::Literal,
        Format::Expression => InstructionFormat::Expression,
    };
    let compiled = ProgramCompiler::new(ModuleRegistry::standard().shared())
        .with_options(CompileOptions { format })
        .compile(&workspace.blocks);
    for diagnostic in &compiled.diagnostics {
        println!("{diagnostic}");
    }
    if compiled.has_errors() {
        anyhow::bail!("workspace has compile errors");
    }

    let mut app = build_headless_app_with(
        config,
        SimulationConfig {
            delta_seconds: args.delta,
        },
    );
    if let Some(path) = &args.layout {
        let layout = FieldLayout::from_file(path)
            .with_context(|| format!("Failed to load layout {}", path.display()))?;
        let inserted = layout
            .populate(&mut app.world.resource_mut::<ResourceField>())
            .with_context(|| format!("Failed to populate layout {}", path.display()))?;
        println!("seeded {inserted} resource node(s)");
    }
    spawn_agent(&mut app, AGENT, args.start);
    load_program(&mut app, AGENT, compiled.program);

    let mut last_status = None;
    for tick_index in 0..args.ticks {
        run_tick(&mut app);
        let programs = app.world.resource::<AgentPrograms>();
        let Some(slot) = programs.get(AGENT) else {
            break;
        };
        let status = slot.engine.status();
        if last_status != Some(status) {
            println!("=== tick {tick_index} status ===");
            println!("{}", serde_json::to_string_pretty(&slot.engine.debug_state())?);
            last_status = Some(status);
        }
        for envelope in diagnostics.iter().flat_map(|receiver| receiver.try_iter()) {
            println!("[{}] {} {}", envelope.level, envelope.target, envelope.message);
        }
        if status != EngineStatus::Running {
            break;
        }
    }

    let programs = app.world.resource::<AgentPrograms>();
    if let Some(slot) = programs.get(AGENT) {
        println!("=== summary ===");
        println!("{}", serde_json::to_string_pretty(&slot.agent.summary())?);
    }
    Ok(())
}

fn parse_position(raw: &str) -> Result<Vec2, String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| "position must be in x,y form".to_string())?;
    let x: f32 = x.trim().parse().map_err(|err| format!("invalid x: {err}"))?;
    let y: f32 = y.trim().parse().map_err(|err| format!("invalid y: {err}"))?;
    Ok(Vec2::new(x, y))
}
