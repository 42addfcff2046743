pub mod paths;
pub mod permission;
pub mod registry;
pub mod safety;
pub mod tool;
pub mod tools;

pub use paths::{normalize_key, normalize_path};
pub use permission::{
    classify, PermissionConfig, PermissionDecision, PermissionTier, RolePermissions, ToolClass,
};
pub use registry::{RegistryError, RemoteToolSource, ToolRegistry};
pub use safety::{
    contains_secret, redact_secrets, should_store_in_memory, PolicyEvaluator, RuleEvaluator,
    SafetyAction, SafetyCategory, SafetyError, SafetyGate, SafetyPolicy, SafetyVerdict,
};
pub use tool::{
    bare_name, canonical_key, is_external, qualify, split_key, EchoTool, Tool, ToolContext,
    ToolDefinition, ToolError, ToolFailure, ToolInvocationResult, ToolOutput, DELEGATE_TOOL_NAME,
    LOCAL_SERVER_ID,
};
pub use tools::{
    FileDeleteTool, FileMoveTool, FileReadTool, FileWriteTool, HttpFetchTool, ListDirectoryTool,
    ShellExecuteTool,
};
