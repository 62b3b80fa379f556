//! Data contracts shared by the block compiler and the agent runtime.
//!
//! Two families of types live here: the authored block workspace (what the
//! editor hands over, see [`BlockInstance`]) and the compiled instruction
//! program the interpreter executes (see [`CompiledProgram`]). Neither
//! depends on the simulation so both sides can be tested in isolation.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Plain 2D coordinate used at the schema boundary.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Authored workspace
// ---------------------------------------------------------------------------

/// Root of an authored workspace: every top-level block on the canvas.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkspaceState {
    #[serde(default)]
    pub blocks: Vec<BlockInstance>,
}

/// One node of the user-authored program tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockInstance {
    /// Unique id of this placed block; carried into compiled instructions.
    pub instance_id: String,
    /// Catalog id of the block kind (`move`, `repeat`, `if`, ...).
    pub block_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    /// Expression overrides keyed by parameter name.
    #[serde(default)]
    pub expressions: BTreeMap<String, Expression>,
    /// Child slots in author order.
    #[serde(default)]
    pub slots: Vec<BlockSlot>,
}

impl BlockInstance {
    pub fn new(instance_id: impl Into<String>, block_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            block_id: block_id.into(),
            parameters: BTreeMap::new(),
            expressions: BTreeMap::new(),
            slots: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_expression(mut self, name: impl Into<String>, expression: Expression) -> Self {
        self.expressions.insert(name.into(), expression);
        self
    }

    /// Appends children to the named slot, creating it if needed.
    pub fn with_slot(mut self, name: impl Into<String>, children: Vec<BlockInstance>) -> Self {
        let name = name.into();
        match self.slots.iter_mut().find(|slot| slot.name == name) {
            Some(slot) => slot.children.extend(children),
            None => self.slots.push(BlockSlot { name, children }),
        }
        self
    }

    pub fn slot(&self, name: &str) -> Option<&[BlockInstance]> {
        self.slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.children.as_slice())
    }

    pub fn number_parameter(&self, name: &str) -> Option<f64> {
        match self.parameters.get(name)? {
            ParameterValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn bool_parameter(&self, name: &str) -> Option<bool> {
        match self.parameters.get(name)? {
            ParameterValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn text_parameter(&self, name: &str) -> Option<&str> {
        match self.parameters.get(name)? {
            ParameterValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn point_parameter(&self, name: &str) -> Option<Point> {
        match self.parameters.get(name)? {
            ParameterValue::Point(value) => Some(*value),
            _ => None,
        }
    }
}

/// Named child slot of a block (`do`, `then`, `else`, `branch-a`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlockSlot {
    pub name: String,
    #[serde(default)]
    pub children: Vec<BlockInstance>,
}

/// Literal parameter value as stored by the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Number(f64),
    Text(String),
    Point(Point),
}

// ---------------------------------------------------------------------------
// Expressions and bindings
// ---------------------------------------------------------------------------

/// Value type an expression is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    Number,
    Boolean,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Number => write!(f, "number"),
            ValueKind::Boolean => write!(f, "boolean"),
        }
    }
}

/// Typed reference to a telemetry signal published by an agent module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignalRef {
    pub module_id: String,
    pub signal_id: String,
    pub expected: ValueKind,
}

impl SignalRef {
    pub fn new(module_id: impl Into<String>, signal_id: impl Into<String>, expected: ValueKind) -> Self {
        Self {
            module_id: module_id.into(),
            signal_id: signal_id.into(),
            expected,
        }
    }
}

impl fmt::Display for SignalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module_id, self.signal_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum LiteralValue {
    Boolean(bool),
    Number(f64),
}

impl LiteralValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            LiteralValue::Boolean(_) => ValueKind::Boolean,
            LiteralValue::Number(_) => ValueKind::Number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum OperatorKind {
    Add,
    And,
    GreaterThan,
    /// Any operator name this build does not understand.
    #[serde(other)]
    Unsupported,
}

/// Dynamically evaluated parameter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Expression {
    Literal {
        value: LiteralValue,
    },
    Signal {
        signal: SignalRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback: Option<Box<Expression>>,
    },
    Operator {
        operator: OperatorKind,
        #[serde(default)]
        inputs: Vec<Expression>,
    },
}

impl Expression {
    pub fn number(value: f64) -> Self {
        Expression::Literal {
            value: LiteralValue::Number(value),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Expression::Literal {
            value: LiteralValue::Boolean(value),
        }
    }

    pub fn signal(signal: SignalRef, fallback: Option<Expression>) -> Self {
        Expression::Signal {
            signal,
            fallback: fallback.map(Box::new),
        }
    }

    pub fn operator(operator: OperatorKind, inputs: Vec<Expression>) -> Self {
        Expression::Operator { operator, inputs }
    }

    /// Visits every signal reference in the expression tree, fallbacks included.
    pub fn for_each_signal<'a>(&'a self, visit: &mut dyn FnMut(&'a SignalRef)) {
        match self {
            Expression::Literal { .. } => {}
            Expression::Signal { signal, fallback } => {
                visit(signal);
                if let Some(fallback) = fallback {
                    fallback.for_each_signal(visit);
                }
            }
            Expression::Operator { inputs, .. } => {
                for input in inputs {
                    input.for_each_signal(visit);
                }
            }
        }
    }
}

/// Numeric parameter: literal fallback plus optional expression override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberBinding {
    pub literal: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
}

impl NumberBinding {
    pub fn literal(value: f64) -> Self {
        Self {
            literal: value,
            expression: None,
        }
    }

    pub fn with_expression(literal: f64, expression: Expression) -> Self {
        Self {
            literal,
            expression: Some(expression),
        }
    }
}

/// Boolean parameter: literal fallback plus optional expression override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanBinding {
    pub literal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<Expression>,
}

impl BooleanBinding {
    pub fn literal(value: bool) -> Self {
        Self {
            literal: value,
            expression: None,
        }
    }

    pub fn with_expression(literal: bool, expression: Expression) -> Self {
        Self {
            literal,
            expression: Some(expression),
        }
    }
}

/// Where a `move-to` or `use-item` instruction should aim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetBinding {
    pub use_scan_hit: bool,
    /// 1-based index into scan memory.
    pub scan_hit_index: NumberBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
}

impl Default for TargetBinding {
    fn default() -> Self {
        Self {
            use_scan_hit: false,
            scan_hit_index: NumberBinding::literal(1.0),
            position: None,
        }
    }
}

impl TargetBinding {
    pub fn scan_hit(index: usize) -> Self {
        Self {
            use_scan_hit: true,
            scan_hit_index: NumberBinding::literal(index as f64),
            position: None,
        }
    }

    pub fn position(point: Point) -> Self {
        Self {
            position: Some(point),
            ..Self::default()
        }
    }
}

/// Optional fields of a storage transfer; omitted fields defer to the module.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub box_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<NumberBinding>,
}

// ---------------------------------------------------------------------------
// Compiled program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum LoopMode {
    Forever,
    Counted { iterations: NumberBinding },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InstructionKind {
    Move {
        duration: NumberBinding,
        speed: NumberBinding,
    },
    MoveTo {
        duration: NumberBinding,
        speed: NumberBinding,
        target: TargetBinding,
    },
    Turn {
        duration: NumberBinding,
        /// Degrees per second; positive turns counter-clockwise.
        rate: NumberBinding,
    },
    Wait {
        duration: NumberBinding,
    },
    Scan {
        duration: NumberBinding,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    Gather {
        duration: NumberBinding,
    },
    UseItem {
        duration: NumberBinding,
        /// 1-based inventory slot.
        slot: NumberBinding,
        target: TargetBinding,
    },
    Deposit {
        duration: NumberBinding,
    },
    StoreStorage {
        duration: NumberBinding,
        request: StorageRequest,
    },
    WithdrawStorage {
        duration: NumberBinding,
        request: StorageRequest,
    },
    StatusToggle {
        duration: NumberBinding,
    },
    StatusSet {
        duration: NumberBinding,
        value: BooleanBinding,
    },
    Loop {
        #[serde(flatten)]
        mode: LoopMode,
        body: Vec<BlockInstruction>,
    },
    #[serde(rename_all = "camelCase")]
    Branch {
        condition: BooleanBinding,
        when_true: Vec<BlockInstruction>,
        when_false: Vec<BlockInstruction>,
    },
}

impl InstructionKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::Move { .. } => "move",
            InstructionKind::MoveTo { .. } => "move-to",
            InstructionKind::Turn { .. } => "turn",
            InstructionKind::Wait { .. } => "wait",
            InstructionKind::Scan { .. } => "scan",
            InstructionKind::Gather { .. } => "gather",
            InstructionKind::UseItem { .. } => "use-item",
            InstructionKind::Deposit { .. } => "deposit",
            InstructionKind::StoreStorage { .. } => "store-storage",
            InstructionKind::WithdrawStorage { .. } => "withdraw-storage",
            InstructionKind::StatusToggle { .. } => "status-toggle",
            InstructionKind::StatusSet { .. } => "status-set",
            InstructionKind::Loop { .. } => "loop",
            InstructionKind::Branch { .. } => "branch",
        }
    }

    /// Duration binding of timed instructions; `None` for loops and branches.
    pub fn duration(&self) -> Option<&NumberBinding> {
        match self {
            InstructionKind::Move { duration, .. }
            | InstructionKind::MoveTo { duration, .. }
            | InstructionKind::Turn { duration, .. }
            | InstructionKind::Wait { duration }
            | InstructionKind::Scan { duration, .. }
            | InstructionKind::Gather { duration }
            | InstructionKind::UseItem { duration, .. }
            | InstructionKind::Deposit { duration }
            | InstructionKind::StoreStorage { duration, .. }
            | InstructionKind::WithdrawStorage { duration, .. }
            | InstructionKind::StatusToggle { duration }
            | InstructionKind::StatusSet { duration, .. } => Some(duration),
            InstructionKind::Loop { .. } | InstructionKind::Branch { .. } => None,
        }
    }
}

/// One compiled instruction with provenance back to its source block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInstruction {
    pub id: String,
    pub source_block_id: String,
    #[serde(flatten)]
    pub kind: InstructionKind,
}

impl BlockInstruction {
    pub fn new(id: impl Into<String>, source_block_id: impl Into<String>, kind: InstructionKind) -> Self {
        Self {
            id: id.into(),
            source_block_id: source_block_id.into(),
            kind,
        }
    }
}

/// Immutable nested instruction list produced by the compiler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub instructions: Vec<BlockInstruction>,
}

impl CompiledProgram {
    pub fn new(instructions: Vec<BlockInstruction>) -> Self {
        Self { instructions }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Counts every instruction, including those nested in loops and branches.
    pub fn instruction_count(&self) -> usize {
        fn count(list: &[BlockInstruction]) -> usize {
            list.iter()
                .map(|instruction| {
                    1 + match &instruction.kind {
                        InstructionKind::Loop { body, .. } => count(body),
                        InstructionKind::Branch {
                            when_true,
                            when_false,
                            ..
                        } => count(when_true) + count(when_false),
                        _ => 0,
                    }
                })
                .sum()
        }
        count(&self.instructions)
    }

    /// Depth-first lookup by instruction id.
    pub fn find(&self, id: &str) -> Option<&BlockInstruction> {
        fn search<'a>(list: &'a [BlockInstruction], id: &str) -> Option<&'a BlockInstruction> {
            for instruction in list {
                if instruction.id == id {
                    return Some(instruction);
                }
                let nested = match &instruction.kind {
                    InstructionKind::Loop { body, .. } => search(body, id),
                    InstructionKind::Branch {
                        when_true,
                        when_false,
                        ..
                    } => search(when_true, id).or_else(|| search(when_false, id)),
                    _ => None,
                };
                if nested.is_some() {
                    return nested;
                }
            }
            None
        }
        search(&self.instructions, id)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

impl Diagnostic {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(DiagnosticSeverity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagnosticSeverity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(DiagnosticSeverity::Error, message)
    }

    fn new(severity: DiagnosticSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            block_id: None,
        }
    }

    pub fn with_block(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            DiagnosticSeverity::Info => "info",
            DiagnosticSeverity::Warning => "warning",
            DiagnosticSeverity::Error => "error",
        };
        match &self.block_id {
            Some(block) => write!(f, "{label} [{block}]: {}", self.message),
            None => write!(f, "{label}: {}", self.message),
        }
    }
}

/// Output of a compile pass: always a program, possibly empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompileResult {
    pub program: CompiledProgram,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|diagnostic| diagnostic.severity == DiagnosticSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity == DiagnosticSeverity::Warning)
    }
}
