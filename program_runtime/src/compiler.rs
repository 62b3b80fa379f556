//! Block tree → instruction program compiler.
//!
//! Compilation never fails: every problem becomes a [`Diagnostic`] and the
//! offending block contributes zero instructions.

use std::collections::HashSet;
use std::sync::Arc;

use program_schema::{
    BlockInstance, BlockInstruction, BooleanBinding, CompileResult, CompiledProgram, Diagnostic,
    Expression, InstructionKind, LoopMode, NumberBinding, ParameterValue, StorageRequest,
    TargetBinding, ValueKind,
};
use tracing::debug;

use crate::catalog::{BlockCatalog, BlockKind};
use crate::registry::ModuleRegistry;

/// Catalog id of the trigger block a program starts from.
pub const ENTRY_BLOCK_ID: &str = "start";
/// Iterations used by `repeat` blocks without a configured count.
pub const DEFAULT_REPEAT_COUNT: u32 = 3;
/// Largest pass count a literal-format `repeat` unrolls to.
pub const MAX_UNROLLED_REPEAT: usize = 1_000;

const DEFAULT_MOVE_SPEED: f64 = 60.0;
const DEFAULT_TURN_RATE: f64 = 90.0;

/// Shape of the emitted instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstructionFormat {
    /// Legacy format: literal bindings only, repeats unrolled inline.
    Literal,
    /// Expression-capable bindings and real loop instructions.
    #[default]
    Expression,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub format: InstructionFormat,
}

/// Compiles authored workspaces against an injected module registry.
#[derive(Debug, Clone)]
pub struct ProgramCompiler {
    modules: Arc<ModuleRegistry>,
    catalog: BlockCatalog,
    options: CompileOptions,
}

impl ProgramCompiler {
    pub fn new(modules: Arc<ModuleRegistry>) -> Self {
        Self {
            modules,
            catalog: BlockCatalog::standard(),
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    /// Compiles the top-level blocks of a workspace.
    pub fn compile(&self, blocks: &[BlockInstance]) -> CompileResult {
        let mut pass = CompilePass::new(self);

        let entries: Vec<&BlockInstance> = blocks
            .iter()
            .filter(|block| block.block_id == ENTRY_BLOCK_ID)
            .collect();

        let Some(entry) = entries.first() else {
            pass.diagnostics.push(Diagnostic::warning(
                "No trigger block found: add a 'When started' trigger block to run a program.",
            ));
            return pass.finish(Vec::new());
        };

        for ignored in entries.iter().skip(1) {
            pass.diagnostics.push(
                Diagnostic::warning(format!(
                    "Only one trigger block runs; '{}' is ignored.",
                    ignored.instance_id
                ))
                .with_block(ignored.instance_id.clone()),
            );
        }

        let detached = blocks.len() - entries.len();
        if detached > 0 {
            pass.diagnostics.push(Diagnostic::info(format!(
                "{detached} top-level block(s) are not attached to the trigger and will not run."
            )));
        }

        let instructions = pass.compile_slots(entry);
        pass.finish(instructions)
    }
}

struct CompilePass<'a> {
    compiler: &'a ProgramCompiler,
    diagnostics: Vec<Diagnostic>,
    unsupported_seen: HashSet<String>,
    parallel_warned: bool,
    expressions_dropped: bool,
}

impl<'a> CompilePass<'a> {
    fn new(compiler: &'a ProgramCompiler) -> Self {
        Self {
            compiler,
            diagnostics: Vec::new(),
            unsupported_seen: HashSet::new(),
            parallel_warned: false,
            expressions_dropped: false,
        }
    }

    fn finish(mut self, instructions: Vec<BlockInstruction>) -> CompileResult {
        if self.expressions_dropped {
            self.diagnostics.push(Diagnostic::info(
                "Expressions are ignored by the literal instruction format; literal values are used.",
            ));
        }
        let program = CompiledProgram::new(instructions);
        debug!(
            target: "rover::compiler",
            instructions = program.instruction_count(),
            diagnostics = self.diagnostics.len(),
            "program.compiled"
        );
        CompileResult {
            program,
            diagnostics: self.diagnostics,
        }
    }

    fn literal_format(&self) -> bool {
        self.compiler.options.format == InstructionFormat::Literal
    }

    /// Every slot of the block, in author order, flattened.
    fn compile_slots(&mut self, block: &BlockInstance) -> Vec<BlockInstruction> {
        let mut out = Vec::new();
        for slot in &block.slots {
            for child in &slot.children {
                out.extend(self.compile_block(child));
            }
        }
        out
    }

    fn compile_named_slot(&mut self, block: &BlockInstance, name: &str) -> Vec<BlockInstruction> {
        let mut out = Vec::new();
        if let Some(children) = block.slot(name) {
            for child in children {
                out.extend(self.compile_block(child));
            }
        }
        out
    }

    fn compile_block(&mut self, block: &BlockInstance) -> Vec<BlockInstruction> {
        let Some(spec) = self.compiler.catalog.get(&block.block_id) else {
            self.unsupported(block, &block.block_id);
            return Vec::new();
        };

        let kind = match spec.kind {
            BlockKind::Start => {
                self.unsupported(block, "nested trigger");
                return Vec::new();
            }
            BlockKind::Move => InstructionKind::Move {
                duration: self.number(block, "duration", 1.0),
                speed: self.number(block, "speed", DEFAULT_MOVE_SPEED),
            },
            BlockKind::MoveTo => InstructionKind::MoveTo {
                duration: self.number(block, "duration", 3.0),
                speed: self.number(block, "speed", DEFAULT_MOVE_SPEED),
                target: self.target(block),
            },
            BlockKind::Turn => InstructionKind::Turn {
                duration: self.number(block, "duration", 1.0),
                rate: self.number(block, "rate", DEFAULT_TURN_RATE),
            },
            BlockKind::Wait => InstructionKind::Wait {
                duration: self.number(block, "duration", 1.0),
            },
            BlockKind::Scan => InstructionKind::Scan {
                duration: self.number(block, "duration", 1.0),
                filter: self.filter(block),
            },
            BlockKind::Gather => InstructionKind::Gather {
                duration: self.number(block, "duration", 1.5),
            },
            BlockKind::UseItem => InstructionKind::UseItem {
                duration: self.number(block, "duration", 3.0),
                slot: self.number(block, "slot", 1.0),
                target: self.target(block),
            },
            BlockKind::Deposit => InstructionKind::Deposit {
                duration: self.number(block, "duration", 1.0),
            },
            BlockKind::StoreStorage => InstructionKind::StoreStorage {
                duration: self.number(block, "duration", 1.0),
                request: self.storage_request(block),
            },
            BlockKind::WithdrawStorage => InstructionKind::WithdrawStorage {
                duration: self.number(block, "duration", 1.0),
                request: self.storage_request(block),
            },
            BlockKind::ToggleStatus => InstructionKind::StatusToggle {
                duration: self.number(block, "duration", 0.0),
            },
            BlockKind::SetStatus => InstructionKind::StatusSet {
                duration: self.number(block, "duration", 0.0),
                value: self.boolean(block, "value", true),
            },
            BlockKind::Repeat => return self.compile_repeat(block),
            BlockKind::Forever => InstructionKind::Loop {
                mode: LoopMode::Forever,
                body: self.compile_slots(block),
            },
            BlockKind::Parallel => {
                if !self.parallel_warned {
                    self.parallel_warned = true;
                    self.diagnostics.push(
                        Diagnostic::warning(
                            "Parallel branches run one after another; true concurrency is not modeled.",
                        )
                        .with_block(block.instance_id.clone()),
                    );
                }
                return self.compile_slots(block);
            }
            BlockKind::If => InstructionKind::Branch {
                condition: self.boolean(block, "condition", false),
                when_true: self.compile_named_slot(block, "then"),
                when_false: self.compile_named_slot(block, "else"),
            },
        };

        vec![BlockInstruction::new(
            block.instance_id.clone(),
            block.instance_id.clone(),
            kind,
        )]
    }

    fn compile_repeat(&mut self, block: &BlockInstance) -> Vec<BlockInstruction> {
        let iterations = self.number(block, "count", f64::from(DEFAULT_REPEAT_COUNT));
        let body = self.compile_slots(block);

        if self.literal_format() {
            if body.is_empty() {
                return Vec::new();
            }
            let requested = iterations.literal.floor().max(0.0);
            let count = if requested > MAX_UNROLLED_REPEAT as f64 {
                self.diagnostics.push(
                    Diagnostic::warning(format!(
                        "Repeat count {requested} is capped at {MAX_UNROLLED_REPEAT} in the literal instruction format."
                    ))
                    .with_block(block.instance_id.clone()),
                );
                MAX_UNROLLED_REPEAT
            } else {
                requested as usize
            };
            let mut out = Vec::with_capacity(body.len().saturating_mul(count));
            for pass in 1..=count {
                out.extend(body.iter().map(|instruction| reid(instruction, pass)));
            }
            return out;
        }

        vec![BlockInstruction::new(
            block.instance_id.clone(),
            block.instance_id.clone(),
            InstructionKind::Loop {
                mode: LoopMode::Counted { iterations },
                body,
            },
        )]
    }

    fn unsupported(&mut self, block: &BlockInstance, kind: &str) {
        if self.unsupported_seen.insert(kind.to_string()) {
            self.diagnostics.push(
                Diagnostic::warning(format!(
                    "Block '{kind}' is not supported yet and was skipped."
                ))
                .with_block(block.instance_id.clone()),
            );
        }
    }

    fn number(&mut self, block: &BlockInstance, name: &str, default: f64) -> NumberBinding {
        let literal = match block.parameters.get(name) {
            None => default,
            Some(ParameterValue::Number(value)) if value.is_finite() => *value,
            Some(_) => {
                self.diagnostics.push(
                    Diagnostic::warning(format!(
                        "Parameter '{name}' is not a finite number; using {default}."
                    ))
                    .with_block(block.instance_id.clone()),
                );
                default
            }
        };
        NumberBinding {
            literal,
            expression: self.expression(block, name, ValueKind::Number),
        }
    }

    fn boolean(&mut self, block: &BlockInstance, name: &str, default: bool) -> BooleanBinding {
        let literal = match block.parameters.get(name) {
            None => default,
            Some(ParameterValue::Boolean(value)) => *value,
            Some(_) => {
                self.diagnostics.push(
                    Diagnostic::warning(format!(
                        "Parameter '{name}' is not a boolean; using {default}."
                    ))
                    .with_block(block.instance_id.clone()),
                );
                default
            }
        };
        BooleanBinding {
            literal,
            expression: self.expression(block, name, ValueKind::Boolean),
        }
    }

    fn expression(
        &mut self,
        block: &BlockInstance,
        name: &str,
        expected: ValueKind,
    ) -> Option<Expression> {
        let expression = block.expressions.get(name)?;
        if self.literal_format() {
            self.expressions_dropped = true;
            return None;
        }

        let mut issues = Vec::new();
        expression.for_each_signal(&mut |signal| {
            if let Err(issue) = self.compiler.modules.validate_signal(signal) {
                issues.push(issue);
            }
        });
        for issue in issues {
            self.diagnostics.push(
                Diagnostic::warning(format!(
                    "Parameter '{name}' ({expected}) reads a signal that may not resolve: {issue}; the fallback will be used."
                ))
                .with_block(block.instance_id.clone()),
            );
        }
        Some(expression.clone())
    }

    fn target(&mut self, block: &BlockInstance) -> TargetBinding {
        TargetBinding {
            use_scan_hit: block.bool_parameter("useScanHit").unwrap_or(false),
            scan_hit_index: self.number(block, "scanHitIndex", 1.0),
            position: block.point_parameter("target").filter(|point| point.is_finite()),
        }
    }

    fn filter(&mut self, block: &BlockInstance) -> Option<String> {
        block
            .text_parameter("filter")
            .map(str::trim)
            .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("any"))
            .map(str::to_string)
    }

    fn storage_request(&mut self, block: &BlockInstance) -> StorageRequest {
        let text = |name: &str| {
            block
                .text_parameter(name)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let amount = if block.parameters.contains_key("amount") || block.expressions.contains_key("amount") {
            Some(self.number(block, "amount", 0.0))
        } else {
            None
        };
        StorageRequest {
            box_id: text("boxId"),
            resource_id: text("resourceId"),
            amount,
        }
    }
}

/// Copy of an instruction tree with ids suffixed for one unrolled pass.
fn reid(instruction: &BlockInstruction, pass: usize) -> BlockInstruction {
    let mut copy = instruction.clone();
    fn walk(instruction: &mut BlockInstruction, pass: usize) {
        instruction.id = format!("{}#{pass}", instruction.id);
        match &mut instruction.kind {
            InstructionKind::Loop { body, .. } => body.iter_mut().for_each(|child| walk(child, pass)),
            InstructionKind::Branch {
                when_true,
                when_false,
                ..
            } => {
                when_true.iter_mut().for_each(|child| walk(child, pass));
                when_false.iter_mut().for_each(|child| walk(child, pass));
            }
            _ => {}
        }
    }
    walk(&mut copy, pass);
    copy
}
