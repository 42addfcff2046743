use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::tool::{is_external, split_key, ToolDefinition, DELEGATE_TOOL_NAME};

/// Ceiling on what a role may do with local tools. Ordered from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionTier {
    None,
    Read,
    ReadWrite,
    Full,
}

impl fmt::Display for PermissionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionTier::None => "none",
            PermissionTier::Read => "read",
            PermissionTier::ReadWrite => "readWrite",
            PermissionTier::Full => "full",
        };
        f.write_str(s)
    }
}

/// Side-effect class of a local tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ToolClass {
    Read,
    Write,
    Execute,
}

impl fmt::Display for ToolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolClass::Read => "read",
            ToolClass::Write => "write",
            ToolClass::Execute => "execute",
        };
        f.write_str(s)
    }
}

/// Classify a bare local tool name.
///
/// Unknown names fall back to prefix heuristics and, failing those, to
/// execute-class so an unrecognised tool is never treated as harmless.
pub fn classify(name: &str) -> ToolClass {
    match name {
        "file_read" | "list_directory" | "http_fetch" | "echo" => ToolClass::Read,
        "file_write" | "file_delete" | "file_move" | DELEGATE_TOOL_NAME => ToolClass::Write,
        "shell_execute" => ToolClass::Execute,
        other => {
            const READ_PREFIXES: [&str; 5] = ["read_", "list_", "get_", "search_", "find_"];
            const WRITE_PREFIXES: [&str; 6] =
                ["write_", "create_", "update_", "delete_", "move_", "edit_"];
            if READ_PREFIXES.iter().any(|p| other.starts_with(p)) {
                ToolClass::Read
            } else if WRITE_PREFIXES.iter().any(|p| other.starts_with(p)) {
                ToolClass::Write
            } else {
                ToolClass::Execute
            }
        }
    }
}

/// Highest tool class a tier admits, or `None` when it admits nothing.
fn ceiling(tier: PermissionTier) -> Option<ToolClass> {
    match tier {
        PermissionTier::None => None,
        PermissionTier::Read => Some(ToolClass::Read),
        PermissionTier::ReadWrite => Some(ToolClass::Write),
        PermissionTier::Full => Some(ToolClass::Execute),
    }
}

/// Tool-access policy for one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionConfig {
    pub tier: PermissionTier,
    /// When present, only listed tools are allowed (after the block list).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PermissionConfig {
    pub fn new(tier: PermissionTier) -> Self {
        Self {
            tier,
            allow_list: None,
            block_list: Vec::new(),
            max_steps: None,
            timeout_ms: None,
        }
    }

    pub fn with_allow_list<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_block_list<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.block_list = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Decide whether this role may call `tool_key`. Pure: no state is read
    /// besides `self` and the key.
    pub fn authorize(&self, tool_key: &str) -> PermissionDecision {
        match self.tier {
            PermissionTier::None => {
                return PermissionDecision::Denied(format!(
                    "tier '{}' does not permit any tools (requested '{}')",
                    self.tier, tool_key
                ));
            }
            PermissionTier::Full => return PermissionDecision::Allowed,
            PermissionTier::Read | PermissionTier::ReadWrite => {}
        }

        let (_, name) = split_key(tool_key);

        if self.block_list.iter().any(|p| pattern_matches(p, tool_key, name)) {
            return PermissionDecision::Denied(format!(
                "tool '{}' is on the block list for tier '{}'",
                name, self.tier
            ));
        }

        if let Some(allow) = &self.allow_list {
            return if allow.iter().any(|p| pattern_matches(p, tool_key, name)) {
                PermissionDecision::Allowed
            } else {
                PermissionDecision::Denied(format!(
                    "tool '{}' is not on the allow list for tier '{}'",
                    name, self.tier
                ))
            };
        }

        // External services are outside the local OS trust boundary.
        if is_external(tool_key) {
            return PermissionDecision::Allowed;
        }

        let class = classify(name);
        match ceiling(self.tier) {
            Some(max) if class <= max => PermissionDecision::Allowed,
            _ => PermissionDecision::Denied(format!(
                "tier '{}' does not permit {}-class tool '{}'",
                self.tier, class, name
            )),
        }
    }

    /// Drop the definitions this role may not call.
    pub fn filter_tools(&self, tools: &[ToolDefinition]) -> Vec<ToolDefinition> {
        tools
            .iter()
            .filter(|t| self.authorize(&t.key).is_allowed())
            .cloned()
            .collect()
    }
}

/// Exact match on the bare name or the full key; a trailing `*` matches by prefix.
fn pattern_matches(pattern: &str, key: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix) || name.starts_with(prefix),
        None => pattern == key || pattern == name,
    }
}

/// Result of checking permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed,
    Denied(String),
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionDecision::Allowed)
    }
}

/// Permission profiles keyed by role name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolePermissions {
    roles: HashMap<String, PermissionConfig>,
}

impl RolePermissions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in profiles: `executor` readWrite, `researcher` read,
    /// `planner` none, `admin` full.
    pub fn builtin() -> Self {
        let mut roles = Self::new();
        roles.insert("executor", PermissionConfig::new(PermissionTier::ReadWrite));
        roles.insert("researcher", PermissionConfig::new(PermissionTier::Read));
        roles.insert("planner", PermissionConfig::new(PermissionTier::None));
        roles.insert("admin", PermissionConfig::new(PermissionTier::Full));
        roles
    }

    pub fn insert(&mut self, role: impl Into<String>, config: PermissionConfig) {
        self.roles.insert(role.into(), config);
    }

    pub fn get(&self, role: &str) -> Option<&PermissionConfig> {
        self.roles.get(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = (&String, &PermissionConfig)> {
        self.roles.iter()
    }

    /// Unknown roles are treated as tier `none`.
    pub fn authorize(&self, role: &str, tool_key: &str) -> PermissionDecision {
        match self.roles.get(role) {
            Some(config) => config.authorize(tool_key),
            None => PermissionDecision::Denied(format!(
                "unknown role '{role}' has tier 'none' (requested '{tool_key}')"
            )),
        }
    }
}
