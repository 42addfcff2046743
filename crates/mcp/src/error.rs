//! Error types for the MCP crate.

use std::time::Duration;

use crate::types::{error_codes, JsonRpcError};

/// Errors that can occur during MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Failed to parse JSON.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Transport I/O error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The requested method is not supported.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid parameters for a method.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The requested tool was not found in the registry.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Server/client not initialized.
    #[error("Not initialized: call initialize first")]
    NotInitialized,

    /// The peer answered with a JSON-RPC error.
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// No response within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,

    /// The MCP server process exited or the connection closed.
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    /// The server id is unknown or not connected.
    #[error("Server '{0}' is not connected")]
    NotConnected(String),

    /// Bad persisted server configuration.
    #[error("Config error: {0}")]
    Config(String),
}

impl McpError {
    /// Convert to a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = match self {
            McpError::JsonParse(_) => error_codes::PARSE_ERROR,
            McpError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) | McpError::ToolNotFound(_) => error_codes::INVALID_PARAMS,
            McpError::NotInitialized => error_codes::NOT_INITIALIZED,
            McpError::Rpc { code, .. } => *code,
            _ => error_codes::INTERNAL_ERROR,
        };
        JsonRpcError {
            code,
            message: self.to_string(),
            data: None,
        }
    }

    /// Whether the failure means the connection itself is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            McpError::ServerUnavailable(_) | McpError::NotConnected(_) | McpError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_codes() {
        assert_eq!(
            McpError::MethodNotFound("x".into()).to_rpc_error().code,
            error_codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            McpError::ToolNotFound("x".into()).to_rpc_error().code,
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            McpError::Rpc { code: -1, message: "m".into() }.to_rpc_error().code,
            -1
        );
        assert_eq!(McpError::Cancelled.to_rpc_error().code, error_codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_connection_loss() {
        assert!(McpError::ServerUnavailable("gone".into()).is_connection_loss());
        assert!(!McpError::Timeout(Duration::from_secs(1)).is_connection_loss());
    }
}
