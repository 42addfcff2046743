//! Delete and move tools.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::resolve_path;
use crate::safety::SafetyAction;
use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};

/// Delete a single file. Directories are refused.
pub struct FileDeleteTool;

#[async_trait]
impl Tool for FileDeleteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_delete",
            "Delete a single file.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to delete" }
                },
                "required": ["path"]
            }),
        )
    }

    fn safety_action(
        &self,
        input: &Value,
        context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError> {
        let path = resolve_path(context, required_str(input, "path")?)?;
        Ok(Some(SafetyAction::FileDelete { path }))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = resolve_path(context, required_str(&input, "path")?)?;
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("cannot stat '{}': {e}", path.display()))
        })?;
        if meta.is_dir() {
            return Err(ToolError::InvalidInput(format!(
                "'{}' is a directory",
                path.display()
            )));
        }

        debug!(path = %path.display(), "deleting file");
        tokio::fs::remove_file(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to delete '{}': {e}", path.display()))
        })?;
        Ok(ToolOutput::text(format!("Deleted {}", path.display())))
    }
}

/// Move or rename a file, creating the destination's parent directories.
pub struct FileMoveTool;

#[async_trait]
impl Tool for FileMoveTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_move",
            "Move or rename a file.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "from": { "type": "string", "description": "Source path" },
                    "to": { "type": "string", "description": "Destination path" }
                },
                "required": ["from", "to"]
            }),
        )
    }

    fn safety_action(
        &self,
        input: &Value,
        context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError> {
        let from = resolve_path(context, required_str(input, "from")?)?;
        let to = resolve_path(context, required_str(input, "to")?)?;
        Ok(Some(SafetyAction::FileMove { from, to }))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let from = resolve_path(context, required_str(&input, "from")?)?;
        let to = resolve_path(context, required_str(&input, "to")?)?;

        if tokio::fs::try_exists(&to).await.unwrap_or(false) {
            return Err(ToolError::InvalidInput(format!(
                "destination '{}' already exists",
                to.display()
            )));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!("failed to create '{}': {e}", parent.display()))
            })?;
        }

        debug!(from = %from.display(), to = %to.display(), "moving file");
        tokio::fs::rename(&from, &to).await.map_err(|e| {
            ToolError::ExecutionFailed(format!(
                "failed to move '{}' to '{}': {e}",
                from.display(),
                to.display()
            ))
        })?;
        Ok(ToolOutput::text(format!(
            "Moved {} to {}",
            from.display(),
            to.display()
        )))
    }
}
