//! Loading authored workspaces from their JSON form.

use std::{fs, io, path::Path, path::PathBuf};

use program_schema::{BlockInstance, WorkspaceState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceParseError {
    #[error("failed to parse workspace JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read workspace from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("duplicate block instance id '{0}'")]
    DuplicateInstance(String),
}

/// Parses a workspace and checks that instance ids are unique across the tree.
pub fn parse_workspace(json: &str) -> Result<WorkspaceState, WorkspaceParseError> {
    let workspace: WorkspaceState = serde_json::from_str(json)?;
    let mut seen = std::collections::HashSet::new();
    let mut stack: Vec<&BlockInstance> = workspace.blocks.iter().collect();
    while let Some(block) = stack.pop() {
        if !seen.insert(block.instance_id.as_str()) {
            return Err(WorkspaceParseError::DuplicateInstance(
                block.instance_id.clone(),
            ));
        }
        for slot in &block.slots {
            stack.extend(slot.children.iter());
        }
    }
    Ok(workspace)
}

pub fn load_workspace(path: &Path) -> Result<WorkspaceState, WorkspaceParseError> {
    let contents = fs::read_to_string(path).map_err(|source| WorkspaceParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_workspace(&contents)
}

/// JSON schema of the workspace format, for editor-side validation.
pub fn workspace_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(WorkspaceState)
}
