//! File reading tool with line range support and binary detection.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::resolve_path;
use crate::safety::SafetyAction;
use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};

/// Read file contents with optional line offset and limit.
pub struct FileReadTool;

impl FileReadTool {
    /// Check if content appears to be binary (contains null bytes in first 8KB).
    fn is_binary(bytes: &[u8]) -> bool {
        let check_len = bytes.len().min(8192);
        bytes[..check_len].contains(&0)
    }
}

/// Render lines `[start, end)` with 1-based, right-aligned line numbers.
pub fn number_lines(lines: &[&str], start: usize) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:>6}\t{}", start + i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse the optional `offset` (1-based) and `limit` arguments.
pub fn line_range(input: &Value) -> (usize, Option<usize>) {
    let offset = input
        .get("offset")
        .and_then(|v| v.as_u64())
        .map(|v| v.max(1) as usize)
        .unwrap_or(1);
    let limit = input.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
    (offset, limit)
}

#[async_trait]
impl Tool for FileReadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_read",
            "Read file contents, optionally restricted to a line range.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path to read (relative to working directory or absolute)"
                    },
                    "offset": {
                        "type": "number",
                        "description": "Starting line number (1-based, default 1)"
                    },
                    "limit": {
                        "type": "number",
                        "description": "Maximum number of lines to return"
                    }
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
        Ok(Some(SafetyAction::FileRead { path }))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = resolve_path(context, required_str(&input, "path")?)?;
        let (offset, limit) = line_range(&input);

        debug!(path = %path.display(), offset = offset, limit = ?limit, "reading file");

        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to read '{}': {e}", path.display()))
        })?;

        if Self::is_binary(&bytes) {
            return Ok(ToolOutput::text(format!("Binary file, {} bytes", bytes.len())));
        }

        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();

        // offset is 1-based
        let start = (offset - 1).min(lines.len());
        let end = match limit {
            Some(l) => (start + l).min(lines.len()),
            None => lines.len(),
        };

        Ok(ToolOutput::text(number_lines(&lines[start..end], start)))
    }
}
