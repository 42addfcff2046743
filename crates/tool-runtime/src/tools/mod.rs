//! Built-in local tools.
//!
//! Every tool here touches the local machine (filesystem, processes, network)
//! and declares its side effect as a [`SafetyAction`](crate::safety::SafetyAction)
//! so the registry can run it past the safety gate first.

pub mod file_ops;
pub mod file_read;
pub mod file_write;
pub mod http_fetch;
pub mod list_dir;
pub mod shell;

pub use file_ops::{FileDeleteTool, FileMoveTool};
pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use http_fetch::HttpFetchTool;
pub use list_dir::ListDirectoryTool;
pub use shell::ShellExecuteTool;

use std::path::{Component, Path, PathBuf};

use crate::paths::normalize_path;
use crate::tool::{Tool, ToolContext, ToolError};

/// Resolve a tool-supplied path against the working directory.
///
/// Explicit `..` components are rejected outright; everything else is
/// normalized so the safety gate and the executing tool see the same path.
pub fn resolve_path(context: &ToolContext, requested: &str) -> Result<PathBuf, ToolError> {
    if Path::new(requested)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::PermissionDenied(format!(
            "path traversal ('..') not allowed: {requested}"
        )));
    }
    Ok(normalize_path(&context.working_directory, requested))
}

/// The full local tool set.
pub fn builtin_tools() -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(FileReadTool),
        Box::new(FileWriteTool),
        Box::new(FileDeleteTool),
        Box::new(FileMoveTool),
        Box::new(ListDirectoryTool),
        Box::new(ShellExecuteTool),
        Box::new(HttpFetchTool::new()),
    ]
}
