//! Program tooling shared by hosts of the rover runtime.
//!
//! This crate re-exports the data contracts from `program_schema` and adds the
//! pieces that operate on them without depending on the simulation in
//! `agent_core`: the module registry, the block catalog, the compiler and
//! workspace loading.

pub mod catalog;
pub mod compiler;
pub mod registry;
pub mod workspace;

pub use catalog::{BlockCatalog, BlockKind, BlockSpec};
pub use compiler::{
    CompileOptions, InstructionFormat, ProgramCompiler, DEFAULT_REPEAT_COUNT, ENTRY_BLOCK_ID,
    MAX_UNROLLED_REPEAT,
};
pub use program_schema::*;
pub use registry::{ActionKind, ModuleRegistry, ModuleSpec, SignalIssue, SignalSpec};
pub use workspace::{load_workspace, parse_workspace, workspace_schema, WorkspaceParseError};
