//! Shell command execution tool.
//!
//! Runs commands via `sh -c` with a capped timeout. The child is killed if
//! the call times out or the run is cancelled.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::resolve_path;
use crate::safety::SafetyAction;
use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};

/// Execute shell commands with timeout and working directory support.
pub struct ShellExecuteTool;

impl ShellExecuteTool {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    const MAX_OUTPUT_BYTES: usize = 64 * 1024;

    fn timeout_secs(input: &Value) -> u64 {
        input
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(Self::DEFAULT_TIMEOUT_SECS)
    }

    fn working_dir(input: &Value, context: &ToolContext) -> Result<PathBuf, ToolError> {
        match input.get("working_dir").and_then(|v| v.as_str()) {
            Some(d) => resolve_path(context, d),
            None => Ok(context.working_directory.clone()),
        }
    }

    fn truncate(mut text: String) -> String {
        if text.len() > Self::MAX_OUTPUT_BYTES {
            let mut cut = Self::MAX_OUTPUT_BYTES;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n... (output truncated)");
        }
        text
    }
}

#[async_trait]
impl Tool for ShellExecuteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "shell_execute",
            "Execute a shell command and return stdout/stderr output.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    },
                    "timeout_secs": {
                        "type": "number",
                        "description": "Timeout in seconds (default 30)"
                    },
                    "working_dir": {
                        "type": "string",
                        "description": "Override working directory for this command"
                    }
                },
                "required": ["command"]
            }),
        )
    }

    fn safety_action(
        &self,
        input: &Value,
        context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError> {
        let command = required_str(input, "command")?.to_string();
        Self::working_dir(input, context)?;
        Ok(Some(SafetyAction::ShellExecute {
            command,
            timeout_secs: Self::timeout_secs(input),
        }))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let command = required_str(&input, "command")?;
        let timeout_secs = Self::timeout_secs(&input);
        let working_dir = Self::working_dir(&input, context)?;

        debug!(
            command = command,
            timeout_secs = timeout_secs,
            working_dir = %working_dir.display(),
            "executing shell command"
        );

        let timeout = Duration::from_secs(timeout_secs);
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn shell: {e}")))?;

        let cancelled = async {
            match &context.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let output = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(ToolError::ExecutionFailed(format!("command execution error: {e}")));
                }
                Err(_) => {
                    warn!(command = command, timeout_secs = timeout_secs, "command timed out");
                    return Err(ToolError::Timeout(timeout));
                }
            },
            _ = cancelled => return Err(ToolError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        let content = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };

        let content = if content.is_empty() {
            format!("(exit code {exit_code})")
        } else {
            Self::truncate(content)
        };

        if output.status.success() {
            Ok(ToolOutput::text(content))
        } else {
            debug!(exit_code = exit_code, "command returned non-zero exit code");
            Ok(ToolOutput::error(content))
        }
    }
}
