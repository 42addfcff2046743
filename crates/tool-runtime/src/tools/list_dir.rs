use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::resolve_path;
use crate::safety::SafetyAction;
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};

const MAX_ENTRIES: usize = 500;

/// List a directory, one entry per line, directories suffixed with `/`.
pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "list_directory",
            "List the entries of a directory.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory to list (default: working directory)"
                    }
                }
            }),
        )
    }

    fn safety_action(
        &self,
        input: &Value,
        context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError> {
        let requested = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = resolve_path(context, requested)?;
        Ok(Some(SafetyAction::FileRead { path }))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let requested = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = resolve_path(context, requested)?;
        debug!(path = %path.display(), "listing directory");

        let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to list '{}': {e}", path.display()))
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        let total = entries.len();
        if total > MAX_ENTRIES {
            entries.truncate(MAX_ENTRIES);
            entries.push(format!("... ({} more entries)", total - MAX_ENTRIES));
        }
        if entries.is_empty() {
            return Ok(ToolOutput::text("(empty directory)"));
        }
        Ok(ToolOutput::text(entries.join("\n")))
    }
}
