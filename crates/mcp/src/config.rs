//! Persisted tool-server records.
//!
//! File format:
//!
//! ```json
//! {
//!   "servers": [
//!     { "id": "fs", "transport": "stdio", "command": "mcp-fs", "args": ["/srv"],
//!       "env": { "TOKEN": "${FS_TOKEN}" }, "autoApprove": ["read_file"] },
//!     { "id": "search", "transport": "streamable-http",
//!       "url": "https://search.example.com/mcp",
//!       "headers": { "Authorization": "Bearer ${SEARCH_KEY}" } }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::McpError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
}

/// One external tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_approve: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    #[serde(alias = "http")]
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::StreamableHttp { .. } => "streamable-http",
        }
    }
}

impl ServerRecord {
    pub fn stdio(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            transport: TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            auto_connect: true,
            enabled: true,
            auto_approve: Vec::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn is_auto_approved(&self, tool_name: &str) -> bool {
        self.auto_approve.iter().any(|t| t == tool_name)
    }

    /// Copy with `${VAR}` references in env values, headers and urls resolved.
    pub fn expanded(&self) -> Self {
        let mut record = self.clone();
        match &mut record.transport {
            TransportConfig::Stdio { env, .. } => {
                for value in env.values_mut() {
                    *value = expand_env_vars(value);
                }
            }
            TransportConfig::Sse { url, headers } | TransportConfig::StreamableHttp { url, headers } => {
                *url = expand_env_vars(url);
                for value in headers.values_mut() {
                    *value = expand_env_vars(value);
                }
            }
        }
        record
    }
}

/// Expand `${VAR}` and `${VAR:-default}` from the process environment.
/// Unset variables without a default expand to the empty string.
pub fn expand_env_vars(value: &str) -> String {
    let mut result = value.to_string();
    let mut cursor = 0;
    while let Some(rel) = result[cursor..].find("${") {
        let start = cursor + rel;
        let Some(end_rel) = result[start..].find('}') else {
            break;
        };
        let end = start + end_rel;
        let expr = &result[start + 2..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((n, d)) => (n, Some(d)),
            None => (expr, None),
        };
        let replacement = match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            _ => match fallback {
                Some(d) => d.to_string(),
                None => {
                    tracing::warn!(var = name, "Environment variable not set, expanding to empty");
                    String::new()
                }
            },
        };
        result.replace_range(start..=end, &replacement);
        cursor = start + replacement.len();
    }
    result
}

/// Parse server records, rejecting duplicate ids and filling empty names.
pub fn parse_servers(json: &str) -> Result<Vec<ServerRecord>, McpError> {
    let file: ServersFile = serde_json::from_str(json)?;
    let mut seen = std::collections::HashSet::new();
    let mut servers = Vec::with_capacity(file.servers.len());
    for mut record in file.servers {
        if record.id.is_empty() || record.id.contains(relay_tool_runtime::tool::KEY_SEPARATOR) {
            return Err(McpError::Config(format!("invalid server id '{}'", record.id)));
        }
        if record.id == relay_tool_runtime::LOCAL_SERVER_ID {
            return Err(McpError::Config("server id 'local' is reserved".into()));
        }
        if !seen.insert(record.id.clone()) {
            return Err(McpError::Config(format!("duplicate server id '{}'", record.id)));
        }
        if record.name.is_empty() {
            record.name = record.id.clone();
        }
        servers.push(record);
    }
    Ok(servers)
}

/// Load server records from `path`. A missing file means no servers.
pub fn load_servers(path: &Path) -> Result<Vec<ServerRecord>, McpError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_servers(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No servers file");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_transports() {
        let servers = parse_servers(
            r#"{"servers": [
                {"id": "fs", "transport": "stdio", "command": "mcp-fs", "args": ["/srv"],
                 "autoApprove": ["read_file"]},
                {"id": "legacy", "transport": "sse", "url": "http://localhost:9000/sse",
                 "autoConnect": false},
                {"id": "search", "name": "Search", "transport": "http",
                 "url": "https://example.com/mcp", "headers": {"X-Key": "k"}, "enabled": false}
            ]}"#,
        )
        .unwrap();

        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].name, "fs");
        assert!(servers[0].is_auto_approved("read_file"));
        assert!(servers[0].auto_connect && servers[0].enabled);
        assert_eq!(servers[1].transport.kind(), "sse");
        assert!(!servers[1].auto_connect);
        assert_eq!(servers[2].display_name(), "Search");
        assert_eq!(servers[2].transport.kind(), "streamable-http");
        assert!(!servers[2].enabled);
    }

    #[test]
    fn test_reject_duplicate_and_reserved_ids() {
        let dup = r#"{"servers": [
            {"id": "a", "transport": "stdio", "command": "x"},
            {"id": "a", "transport": "stdio", "command": "y"}
        ]}"#;
        assert!(matches!(parse_servers(dup), Err(McpError::Config(_))));

        let reserved = r#"{"servers": [{"id": "local", "transport": "stdio", "command": "x"}]}"#;
        assert!(parse_servers(reserved).is_err());

        let separator = r#"{"servers": [{"id": "a::b", "transport": "stdio", "command": "x"}]}"#;
        assert!(parse_servers(separator).is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("RELAY_MCP_TEST_TOKEN", "secret123");
        assert_eq!(
            expand_env_vars("Bearer ${RELAY_MCP_TEST_TOKEN}"),
            "Bearer secret123"
        );
        assert_eq!(expand_env_vars("${RELAY_MCP_TEST_UNSET:-fallback}"), "fallback");
        assert_eq!(expand_env_vars("a${RELAY_MCP_TEST_UNSET}b"), "ab");
        assert_eq!(expand_env_vars("no vars"), "no vars");
        assert_eq!(expand_env_vars("${unterminated"), "${unterminated");
        std::env::remove_var("RELAY_MCP_TEST_TOKEN");
    }

    #[test]
    fn test_expanded_record_only_touches_values() {
        std::env::set_var("RELAY_MCP_TEST_HOST", "example.org");
        let record = parse_servers(
            r#"{"servers": [{"id": "h", "transport": "sse",
                "url": "https://${RELAY_MCP_TEST_HOST}/sse",
                "headers": {"Host": "${RELAY_MCP_TEST_HOST}"}}]}"#,
        )
        .unwrap()
        .remove(0)
        .expanded();
        match record.transport {
            TransportConfig::Sse { url, headers } => {
                assert_eq!(url, "https://example.org/sse");
                assert_eq!(headers["Host"], "example.org");
            }
            other => panic!("unexpected transport {other:?}"),
        }
        std::env::remove_var("RELAY_MCP_TEST_HOST");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let servers = load_servers(Path::new("/nonexistent/relay/servers.json")).unwrap();
        assert!(servers.is_empty());
    }
}
