//! File writing tool with parent directory creation.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::resolve_path;
use crate::safety::SafetyAction;
use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};

/// Write or create files, creating parent directories as needed.
pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "file_write",
            "Write content to a file, creating parent directories if needed.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path to write (relative to working directory or absolute)"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write to the file"
                    }
                },
                "required": ["path", "content"]
            }),
        )
    }

    fn safety_action(
        &self,
        input: &Value,
        context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError> {
        let path = resolve_path(context, required_str(input, "path")?)?;
        let size = required_str(input, "content")?.len() as u64;
        Ok(Some(SafetyAction::FileWrite { path, size }))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = resolve_path(context, required_str(&input, "path")?)?;
        let content = required_str(&input, "content")?;

        debug!(path = %path.display(), bytes = content.len(), "writing file");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::ExecutionFailed(format!(
                    "failed to create parent directories for '{}': {e}",
                    path.display()
                ))
            })?;
        }

        tokio::fs::write(&path, content).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to write '{}': {e}", path.display()))
        })?;

        Ok(ToolOutput::text(format!(
            "Wrote {} bytes to {}",
            content.len(),
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());

        let result = FileWriteTool
            .execute(
                serde_json::json!({"path": "output.txt", "content": "hello world"}),
                &ctx,
            )
            .await
            .unwrap();

        assert!(result.content.contains("11 bytes"));
        let written = tokio::fs::read_to_string(dir.path().join("output.txt"))
            .await
            .unwrap();
        assert_eq!(written, "hello world");
    }

    #[tokio::test]
    async fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());

        FileWriteTool
            .execute(
                serde_json::json!({"path": "sub/dir/file.txt", "content": "nested"}),
                &ctx,
            )
            .await
            .unwrap();

        let written = tokio::fs::read_to_string(dir.path().join("sub/dir/file.txt"))
            .await
            .unwrap();
        assert_eq!(written, "nested");
    }

    #[test]
    fn test_safety_action_reports_size() {
        let ctx = ToolContext::new("/work");
        let action = FileWriteTool
            .safety_action(&serde_json::json!({"path": "a.txt", "content": "12345"}), &ctx)
            .unwrap();
        assert_eq!(
            action,
            Some(SafetyAction::FileWrite { path: "/work/a.txt".into(), size: 5 })
        );
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileWriteTool
            .execute(
                serde_json::json!({"path": "../escape.txt", "content": "bad"}),
                &ToolContext::new(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied(_)));
    }
}
