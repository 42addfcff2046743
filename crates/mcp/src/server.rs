//! MCP server implementation.
//!
//! Wraps a `ToolRegistry` and exposes its local tools over the MCP protocol.
//! Calls go through the registry, so the safety gate applies to remote
//! callers exactly as it does in-process.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use relay_tool_runtime::{ToolContext, ToolRegistry};

use crate::error::McpError;
use crate::transport::McpTransport;
use crate::types::*;

/// Handle for telling connected clients that the tool catalog changed.
#[derive(Clone)]
pub struct ToolsChangedNotifier {
    tx: mpsc::Sender<()>,
}

impl ToolsChangedNotifier {
    /// Queue a `notifications/tools/list_changed`. Returns false once the
    /// server loop has exited.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// MCP server that bridges a `ToolRegistry` to MCP clients.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    server_name: String,
    server_version: String,
    initialized: bool,
    working_directory: PathBuf,
    changed_tx: mpsc::Sender<()>,
    changed_rx: mpsc::Receiver<()>,
}

impl McpServer {
    /// Create a new MCP server wrapping the given tool registry.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let (changed_tx, changed_rx) = mpsc::channel(4);
        Self {
            registry,
            server_name: "relay".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            initialized: false,
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            changed_tx,
            changed_rx,
        }
    }

    /// Set the server name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set the working directory for tool execution.
    pub fn with_working_directory(mut self, dir: PathBuf) -> Self {
        self.working_directory = dir;
        self
    }

    pub fn notifier(&self) -> ToolsChangedNotifier {
        ToolsChangedNotifier {
            tx: self.changed_tx.clone(),
        }
    }

    /// Run the server loop, reading from and writing to the transport.
    ///
    /// Processes JSON-RPC requests until the transport is closed.
    pub async fn run<T: McpTransport + ?Sized>(&mut self, transport: &mut T) -> Result<(), McpError> {
        tracing::info!(server = %self.server_name, "MCP server starting");

        loop {
            let line = tokio::select! {
                incoming = transport.receive() => match incoming? {
                    Some(line) => line,
                    None => {
                        tracing::info!("Transport closed, shutting down");
                        break;
                    }
                },
                Some(()) = self.changed_rx.recv() => {
                    if self.initialized {
                        let notif = JsonRpcNotification::new(methods::TOOLS_LIST_CHANGED, None);
                        transport.send(&serde_json::to_string(&notif)?).await?;
                    }
                    continue;
                }
            };

            tracing::debug!(message = %line, "Received message");

            match IncomingMessage::parse(&line) {
                Ok(IncomingMessage::Request(request)) => {
                    let response = self.handle_request(&request).await;
                    let json = serde_json::to_string(&response)?;
                    tracing::debug!(response = %json, "Sending response");
                    transport.send(&json).await?;
                }
                Ok(IncomingMessage::Notification(notif)) => self.handle_notification(&notif),
                Ok(IncomingMessage::Response(resp)) => {
                    tracing::debug!(id = ?resp.id, "Ignoring response from client");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse JSON-RPC message");
                    let err = McpError::JsonParse(e).to_rpc_error();
                    let resp = JsonRpcResponse::error(RpcId::Number(0), err.code, err.message);
                    transport.send(&serde_json::to_string(&resp)?).await?;
                }
            }
        }

        Ok(())
    }

    /// Handle a single JSON-RPC request and produce a response.
    pub async fn handle_request(&mut self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();

        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(id, &request.params),
            methods::PING => JsonRpcResponse::success(id, serde_json::json!({})),
            methods::TOOLS_LIST | methods::TOOLS_CALL if !self.initialized => {
                error_response(id, McpError::NotInitialized)
            }
            methods::TOOLS_LIST => self.handle_list_tools(id),
            methods::TOOLS_CALL => self.handle_call_tool(id, &request.params).await,
            method => {
                tracing::warn!(method = %method, "Unknown method");
                error_response(id, McpError::MethodNotFound(method.to_string()))
            }
        }
    }

    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            methods::INITIALIZED => {
                tracing::info!("Client confirmed initialization");
            }
            methods::CANCELLED => {
                tracing::debug!(params = ?notif.params, "Client cancelled a request");
            }
            method => {
                tracing::debug!(method = %method, "Unknown notification, ignoring");
            }
        }
    }

    fn handle_initialize(&mut self, id: RpcId, params: &Option<Value>) -> JsonRpcResponse {
        let client = params
            .as_ref()
            .and_then(|p| serde_json::from_value::<InitializeParams>(p.clone()).ok());
        match &client {
            Some(p) => tracing::info!(
                client = %p.client_info.name,
                protocol = %p.protocol_version,
                "Handling initialize"
            ),
            None => tracing::info!("Handling initialize (no client info)"),
        }
        self.initialized = true;

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
            },
            server_info: ServerInfo {
                name: self.server_name.clone(),
                version: Some(self.server_version.clone()),
            },
        };
        to_response(id, result)
    }

    fn handle_list_tools(&self, id: RpcId) -> JsonRpcResponse {
        tracing::debug!("Handling tools/list");

        let tools: Vec<ToolInfo> = self
            .registry
            .local_definitions()
            .into_iter()
            .map(ToolInfo::from)
            .collect();
        to_response(id, ListToolsResult { tools, next_cursor: None })
    }

    async fn handle_call_tool(&self, id: RpcId, params: &Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return error_response(id, McpError::InvalidParams("missing params".to_string()));
        };

        let call_params: CallToolParams = match serde_json::from_value(params.clone()) {
            Ok(p) => p,
            Err(e) => return error_response(id, McpError::InvalidParams(e.to_string())),
        };

        tracing::debug!(tool = %call_params.name, "Handling tools/call");

        if self.registry.get(&call_params.name).is_none() {
            return error_response(id, McpError::ToolNotFound(call_params.name));
        }

        let ctx = ToolContext::new(self.working_directory.clone());
        let outcome = self
            .registry
            .call_tool(&call_params.name, call_params.arguments, &ctx)
            .await;

        to_response(id, CallToolResult::text(outcome.content, !outcome.success))
    }
}

fn error_response(id: RpcId, err: McpError) -> JsonRpcResponse {
    let rpc = err.to_rpc_error();
    JsonRpcResponse::error(id, rpc.code, rpc.message)
}

fn to_response<T: serde::Serialize>(id: RpcId, result: T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(val) => JsonRpcResponse::success(id, val),
        Err(e) => error_response(id, McpError::JsonParse(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use relay_tool_runtime::{EchoTool, SafetyGate};

    fn test_registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::with_builtin_tools(SafetyGate::default());
        reg.register(EchoTool).unwrap();
        Arc::new(reg)
    }

    fn init_request(id: i64) -> JsonRpcRequest {
        JsonRpcRequest::new(
            RpcId::Number(id),
            methods::INITIALIZE,
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test-client"}
            })),
        )
    }

    async fn initialized_server() -> McpServer {
        let mut server = McpServer::new(test_registry());
        server.handle_request(&init_request(1)).await;
        server
    }

    #[tokio::test]
    async fn test_handle_initialize() {
        let mut server = McpServer::new(test_registry());
        let resp = server.handle_request(&init_request(1)).await;
        assert!(resp.error.is_none());
        let result: InitializeResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert_eq!(result.server_info.name, "relay");
        assert!(result.capabilities.tools.unwrap().list_changed);
    }

    #[tokio::test]
    async fn test_tools_rejected_before_initialize() {
        let mut server = McpServer::new(test_registry());
        let req = JsonRpcRequest::new(RpcId::Number(2), methods::TOOLS_LIST, None);
        let resp = server.handle_request(&req).await;
        assert_eq!(resp.error.unwrap().code, error_codes::NOT_INITIALIZED);
    }

    #[tokio::test]
    async fn test_handle_list_tools_bare_names() {
        let mut server = initialized_server().await;
        let req = JsonRpcRequest::new(RpcId::Number(2), methods::TOOLS_LIST, None);

        let resp = server.handle_request(&req).await;
        let result: ListToolsResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        let names: Vec<&str> = result.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"file_read"));
        assert!(names.iter().all(|n| !n.contains("::")));
    }

    #[tokio::test]
    async fn test_handle_call_tool() {
        let mut server = initialized_server().await;
        let req = JsonRpcRequest::new(
            RpcId::Number(3),
            methods::TOOLS_CALL,
            Some(serde_json::json!({
                "name": "echo",
                "arguments": {"message": "hello mcp"}
            })),
        );

        let resp = server.handle_request(&req).await;
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), "hello mcp");
    }

    #[tokio::test]
    async fn test_call_tool_goes_through_safety_gate() {
        let mut server = initialized_server().await;
        let req = JsonRpcRequest::new(
            RpcId::Number(4),
            methods::TOOLS_CALL,
            Some(serde_json::json!({
                "name": "shell_execute",
                "arguments": {"command": "sudo reboot"}
            })),
        );

        let resp = server.handle_request(&req).await;
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(result.is_error);
        assert!(result.joined_text().contains("Blocked by safety policy"));
    }

    #[tokio::test]
    async fn test_handle_call_tool_not_found() {
        let mut server = initialized_server().await;
        let req = JsonRpcRequest::new(
            RpcId::Number(5),
            methods::TOOLS_CALL,
            Some(serde_json::json!({"name": "nonexistent", "arguments": {}})),
        );

        let resp = server.handle_request(&req).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_handle_unknown_method() {
        let mut server = McpServer::new(test_registry());
        let req = JsonRpcRequest::new(RpcId::Number(6), "unknown/method", None);

        let resp = server.handle_request(&req).await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_run_with_channel_transport() {
        let (mut client_side, mut server_side) = ChannelTransport::pair();
        let mut server = McpServer::new(test_registry());
        let notifier = server.notifier();

        let server_handle = tokio::spawn(async move { server.run(&mut server_side).await });

        client_side
            .send(&serde_json::to_string(&init_request(1)).unwrap())
            .await
            .unwrap();
        let resp: JsonRpcResponse =
            serde_json::from_str(&client_side.receive().await.unwrap().unwrap()).unwrap();
        assert!(resp.error.is_none());

        assert!(notifier.notify());
        let line = client_side.receive().await.unwrap().unwrap();
        assert!(matches!(
            IncomingMessage::parse(&line).unwrap(),
            IncomingMessage::Notification(n) if n.method == methods::TOOLS_LIST_CHANGED
        ));

        let call_req = JsonRpcRequest::new(
            RpcId::Number(2),
            methods::TOOLS_CALL,
            Some(serde_json::json!({
                "name": "echo",
                "arguments": {"message": "via transport"}
            })),
        );
        client_side
            .send(&serde_json::to_string(&call_req).unwrap())
            .await
            .unwrap();
        let resp: JsonRpcResponse =
            serde_json::from_str(&client_side.receive().await.unwrap().unwrap()).unwrap();
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.joined_text(), "via transport");

        // Dropping the client side closes the transport and lets the server exit.
        drop(client_side);
        server_handle.await.unwrap().unwrap();
        assert!(!notifier.notify());
    }
}
