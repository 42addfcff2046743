use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::safety::SafetyAction;

/// Server id used for in-process tools. `file_read` and `local::file_read`
/// name the same tool.
pub const LOCAL_SERVER_ID: &str = "local";

/// Separator between server id and tool name in a tool key.
pub const KEY_SEPARATOR: &str = "::";

/// Reserved tool name the orchestration loop intercepts to spawn a sub-agent.
pub const DELEGATE_TOOL_NAME: &str = "delegate_task";

/// Split `serverId::name` into its parts. Bare names have no server id.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once(KEY_SEPARATOR) {
        Some((server, name)) => (Some(server), name),
        None => (None, key),
    }
}

/// The tool name without its server prefix.
pub fn bare_name(key: &str) -> &str {
    split_key(key).1
}

/// Build a namespaced key.
pub fn qualify(server_id: &str, name: &str) -> String {
    format!("{server_id}{KEY_SEPARATOR}{name}")
}

/// Whether the key names a tool on an external server (anything but `local`).
pub fn is_external(key: &str) -> bool {
    matches!(split_key(key).0, Some(server) if server != LOCAL_SERVER_ID)
}

/// One spelling per tool: local keys become `local::name`, external keys are unchanged.
pub fn canonical_key(key: &str) -> String {
    if is_external(key) {
        key.to_string()
    } else {
        qualify(LOCAL_SERVER_ID, bare_name(key))
    }
}

/// Describes a tool's interface for the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Globally unique key, `serverId::name`
    pub key: String,
    /// Human-readable description for the engine
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
    /// Listed in the owning server's auto-approve set
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_approve: bool,
}

impl ToolDefinition {
    pub fn new(key: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            input_schema,
            auto_approve: false,
        }
    }

    pub fn name(&self) -> &str {
        bare_name(&self.key)
    }
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.key, self.description)
    }
}

/// Why a tool invocation failed, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    PermissionDenied,
    SafetyBlocked,
    Execution,
    NotConnected,
    UnknownTool,
    DepthExceeded,
}

/// Uniform result of one tool call, whatever the transport or locality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    pub tool_key: String,
    pub success: bool,
    pub content: String,
    pub is_error: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
}

impl ToolInvocationResult {
    pub fn ok(tool_key: impl Into<String>, content: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_key: tool_key.into(),
            success: true,
            content: content.into(),
            is_error: false,
            duration_ms,
            failure: None,
        }
    }

    pub fn failed(
        tool_key: impl Into<String>,
        failure: ToolFailure,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool_key: tool_key.into(),
            success: false,
            content: message.into(),
            is_error: true,
            duration_ms,
            failure: Some(failure),
        }
    }
}

/// Raw output of a local tool before it is wrapped into a [`ToolInvocationResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Context passed to local tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Working directory for file/shell operations
    pub working_directory: PathBuf,
    /// Cooperative abort for long-running tools
    pub cancel: Option<CancellationToken>,
}

impl ToolContext {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            cancel: None,
        }
    }

    /// Resolve a user-supplied path against the working directory.
    pub fn resolve(&self, requested: &str) -> PathBuf {
        let candidate = std::path::Path::new(requested);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.working_directory.join(candidate)
        }
    }
}

/// The extension point for in-process tools.
///
/// Every local tool declares the side effect it is about to perform so the
/// registry can put it in front of the safety gate before `execute` runs.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's definition; the key is the bare local name.
    fn definition(&self) -> ToolDefinition;

    /// The action this call would perform, or `None` for side-effect-free tools.
    fn safety_action(
        &self,
        input: &Value,
        context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError>;

    /// Execute the tool with the given JSON input.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Fetch a required string field from tool input.
pub fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing '{field}' field")))
}

/// Echoes its input back. Handy as a side-effect-free tool in tests and demos.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "Echoes back the input message.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo back"
                    }
                },
                "required": ["message"]
            }),
        )
    }

    fn safety_action(
        &self,
        _input: &Value,
        _context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError> {
        Ok(None)
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let message = required_str(&input, "message")?;
        Ok(ToolOutput::text(message))
    }
}
