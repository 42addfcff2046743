//! HTTP fetch tool (GET/POST) with a capped response body.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::safety::SafetyAction;
use crate::tool::{required_str, Tool, ToolContext, ToolDefinition, ToolError, ToolOutput};

const MAX_BODY_BYTES: usize = 256 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn method(input: &Value) -> Result<String, ToolError> {
        let method = input
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        match method.as_str() {
            "GET" | "POST" => Ok(method),
            other => Err(ToolError::InvalidInput(format!("unsupported method '{other}'"))),
        }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "http_fetch",
            "Fetch a URL over HTTP(S) and return the response body as text.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "Absolute http(s) URL" },
                    "method": {
                        "type": "string",
                        "enum": ["GET", "POST"],
                        "description": "HTTP method (default GET)"
                    },
                    "body": { "type": "string", "description": "Request body for POST" }
                },
                "required": ["url"]
            }),
        )
    }

    fn safety_action(
        &self,
        input: &Value,
        _context: &ToolContext,
    ) -> Result<Option<SafetyAction>, ToolError> {
        Ok(Some(SafetyAction::NetworkRequest {
            url: required_str(input, "url")?.to_string(),
            method: Self::method(input)?,
        }))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let url = required_str(&input, "url")?;
        let method = Self::method(&input)?;
        debug!(url = url, method = %method, "fetching");

        let request = if method == "POST" {
            let body = input.get("body").and_then(|v| v.as_str()).unwrap_or_default();
            self.client.post(url).body(body.to_string())
        } else {
            self.client.get(url)
        };

        let send = async {
            let response = request
                .send()
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {e}")))?;
            let status = response.status();

            let mut body = Vec::new();
            let mut truncated = false;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| ToolError::ExecutionFailed(format!("read failed: {e}")))?;
                let room = MAX_BODY_BYTES - body.len();
                if chunk.len() > room {
                    body.extend_from_slice(&chunk[..room]);
                    truncated = true;
                    break;
                }
                body.extend_from_slice(&chunk);
            }

            let mut text = String::from_utf8_lossy(&body).into_owned();
            if truncated {
                text.push_str("\n... (body truncated)");
            }
            let content = format!("HTTP {}\n\n{}", status.as_u16(), text);
            Ok::<_, ToolError>(if status.is_success() {
                ToolOutput::text(content)
            } else {
                ToolOutput::error(content)
            })
        };

        match &context.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(ToolError::Cancelled),
                res = send => res,
            },
            None => send.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_action_defaults_to_get() {
        let action = HttpFetchTool::new()
            .safety_action(&serde_json::json!({"url": "https://example.com"}), &ToolContext::new("/"))
            .unwrap();
        assert_eq!(
            action,
            Some(SafetyAction::NetworkRequest {
                url: "https://example.com".into(),
                method: "GET".into()
            })
        );
    }

    #[test]
    fn test_rejects_unsupported_method() {
        let err = HttpFetchTool::new()
            .safety_action(
                &serde_json::json!({"url": "https://example.com", "method": "delete"}),
                &ToolContext::new("/"),
            )
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_execution_error() {
        let err = HttpFetchTool::new()
            .execute(
                serde_json::json!({"url": "http://127.0.0.1:9/unreachable"}),
                &ToolContext::new("/"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }
}
