use std::sync::Arc;

use agent_core::{
    build_headless_app_with, load_program, run_tick, spawn_agent, EngineConfig, FieldLayout,
    ResourceField, SimulationConfig,
};
use bevy::math::Vec2;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use program_runtime::{
    BlockInstruction, CompiledProgram, InstructionKind, LoopMode, NumberBinding, TargetBinding,
};

fn patrol_program() -> CompiledProgram {
    let timed = |id: &str, kind| BlockInstruction::new(id, id, kind);
    CompiledProgram::new(vec![timed(
        "loop",
        InstructionKind::Loop {
            mode: LoopMode::Forever,
            body: vec![
                timed(
                    "scan",
                    InstructionKind::Scan {
                        duration: NumberBinding::literal(0.5),
                        filter: None,
                    },
                ),
                timed(
                    "approach",
                    InstructionKind::MoveTo {
                        duration: NumberBinding::literal(2.0),
                        speed: NumberBinding::literal(60.0),
                        target: TargetBinding::scan_hit(1),
                    },
                ),
                timed(
                    "gather",
                    InstructionKind::Gather {
                        duration: NumberBinding::literal(1.5),
                    },
                ),
            ],
        },
    )])
}

fn bench_ticks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ticks");
    let layout = FieldLayout::from_json_str(
        r#"{ "seed": 9, "clusters": [ { "type": "ore", "center": [0.0, 0.0], "radius": 400.0, "count": 200,
             "quantity": { "min": 1.0, "max": 5.0 } } ] }"#,
    )
    .expect("bench layout parses");
    let program = Arc::new(patrol_program());

    for agents in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::new("agents", agents), &agents, |b, &agents| {
            b.iter_batched(
                || {
                    let mut app = build_headless_app_with(
                        Arc::new(EngineConfig::default()),
                        SimulationConfig::default(),
                    );
                    layout
                        .populate(&mut app.world.resource_mut::<ResourceField>())
                        .expect("layout populates");
                    for index in 0..agents {
                        let name = format!("rover-{index}");
                        spawn_agent(&mut app, &name, Vec2::new(index as f32 * 10.0, 0.0));
                        load_program(&mut app, &name, Arc::clone(&program));
                    }
                    app
                },
                |mut app| {
                    for _ in 0..60 {
                        run_tick(&mut app);
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(engine_benches, bench_ticks);
criterion_main!(engine_benches);
