//! MCP client.
//!
//! One background task owns the transport: it writes queued requests and
//! routes every inbound message, either to the request awaiting that id or,
//! for server-initiated traffic, to the event channel. Requests can therefore
//! be issued concurrently from any number of callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::McpError;
use crate::transport::McpTransport;
use crate::types::*;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, McpError>>>>>;

/// Server-initiated happenings the owner of a client should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `notifications/tools/list_changed` arrived.
    ToolsChanged,
    /// The connection ended without `shutdown` being called.
    Closed { reason: String },
}

pub struct McpClient {
    name: String,
    outbound: mpsc::Sender<String>,
    next_id: AtomicI64,
    pending: PendingMap,
    request_timeout: Duration,
    server_info: RwLock<Option<InitializeResult>>,
    tools: RwLock<Vec<ToolInfo>>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl McpClient {
    /// Start the I/O task without performing the handshake.
    pub fn start(
        name: impl Into<String>,
        transport: Box<dyn McpTransport>,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let name = name.into();
        let (outbound, outbound_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_io_loop(IoLoop {
            name: name.clone(),
            transport,
            outbound_rx,
            pending: pending.clone(),
            events_tx,
            shutdown: shutdown.clone(),
            closed: closed.clone(),
        }));

        let client = Self {
            name,
            outbound,
            next_id: AtomicI64::new(1),
            pending,
            request_timeout,
            server_info: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            shutdown,
            closed,
        };
        (client, events_rx)
    }

    /// Start, handshake and fetch the tool catalog.
    pub async fn connect(
        name: impl Into<String>,
        transport: Box<dyn McpTransport>,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), McpError> {
        let (client, events) = Self::start(name, transport, request_timeout);
        client.initialize().await?;
        client.refresh_tools().await?;
        Ok((client, events))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().ok().and_then(|s| s.clone())
    }

    /// Tool catalog as of the last refresh.
    pub fn tools(&self) -> Vec<ToolInfo> {
        self.tools.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "relay".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        };
        let value = self
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?), None)
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        if result.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                server = %self.name,
                theirs = %result.protocol_version,
                ours = PROTOCOL_VERSION,
                "Protocol version mismatch, continuing"
            );
        }
        tracing::info!(
            server = %self.name,
            remote = %result.server_info.name,
            "MCP handshake complete"
        );

        self.notify(methods::INITIALIZED, None).await?;
        if let Ok(mut slot) = self.server_info.write() {
            *slot = Some(result.clone());
        }
        Ok(result)
    }

    /// Fetch every page of `tools/list`.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>, McpError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let params = serde_json::to_value(ListToolsParams { cursor })?;
            let value = self.request(methods::TOOLS_LIST, Some(params), None).await?;
            let page: ListToolsResult = serde_json::from_value(value)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Re-fetch the catalog and cache it.
    pub async fn refresh_tools(&self) -> Result<usize, McpError> {
        let tools = self.list_tools().await?;
        let count = tools.len();
        if let Ok(mut slot) = self.tools.write() {
            *slot = tools;
        }
        tracing::debug!(server = %self.name, count, "Tool catalog refreshed");
        Ok(count)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        let value = self.request(methods::TOOLS_CALL, Some(params), cancel).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Stop the I/O task and close the transport. Pending requests fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let json = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.outbound
            .send(json)
            .await
            .map_err(|_| McpError::ServerUnavailable("connection closed".into()))
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        if self.is_closed() {
            return Err(McpError::ServerUnavailable("connection closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let json = serde_json::to_string(&JsonRpcRequest::new(RpcId::Number(id), method, params))?;
        if self.outbound.send(json).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(McpError::ServerUnavailable("connection closed".into()));
        }

        let wait = tokio::time::timeout(self.request_timeout, rx);
        let outcome = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => None,
                res = wait => Some(res),
            },
            None => Some(wait.await),
        };

        match outcome {
            Some(Ok(Ok(result))) => result,
            Some(Ok(Err(_))) => Err(McpError::ServerUnavailable("response channel dropped".into())),
            Some(Err(_)) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!(server = %self.name, method, id, "MCP request timed out");
                Err(McpError::Timeout(self.request_timeout))
            }
            None => {
                self.pending.lock().await.remove(&id);
                let params = serde_json::json!({"requestId": id, "reason": "cancelled by caller"});
                let _ = self.notify(methods::CANCELLED, Some(params)).await;
                Err(McpError::Cancelled)
            }
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct IoLoop {
    name: String,
    transport: Box<dyn McpTransport>,
    outbound_rx: mpsc::Receiver<String>,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    shutdown: CancellationToken,
    closed: Arc<AtomicBool>,
}

async fn run_io_loop(mut io: IoLoop) {
    let reason = loop {
        tokio::select! {
            _ = io.shutdown.cancelled() => break None,
            outgoing = io.outbound_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = io.transport.send(&message).await {
                        break Some(format!("send failed: {e}"));
                    }
                }
                None => break None,
            },
            incoming = io.transport.receive() => match incoming {
                Ok(Some(line)) => handle_incoming(&mut io, &line).await,
                Ok(None) => break Some("connection closed".to_string()),
                Err(e) => break Some(e.to_string()),
            },
        }
    };

    io.closed.store(true, Ordering::SeqCst);
    if let Err(e) = io.transport.close().await {
        tracing::debug!(server = %io.name, error = %e, "Transport close failed");
    }

    let message = reason.clone().unwrap_or_else(|| "client shut down".to_string());
    for (_, tx) in io.pending.lock().await.drain() {
        let _ = tx.send(Err(McpError::ServerUnavailable(message.clone())));
    }

    match reason {
        Some(reason) => {
            tracing::warn!(server = %io.name, reason = %reason, "MCP connection lost");
            let _ = io.events_tx.send(ClientEvent::Closed { reason });
        }
        None => tracing::debug!(server = %io.name, "MCP client stopped"),
    }
}

async fn handle_incoming(io: &mut IoLoop, line: &str) {
    let message = match IncomingMessage::parse(line) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(server = %io.name, error = %e, "Ignoring unparseable message");
            return;
        }
    };

    match message {
        IncomingMessage::Response(resp) => {
            let RpcId::Number(id) = resp.id else {
                tracing::debug!(server = %io.name, id = ?resp.id, "Response with foreign id");
                return;
            };
            let Some(tx) = io.pending.lock().await.remove(&id) else {
                tracing::debug!(server = %io.name, id, "Response for unknown or expired request");
                return;
            };
            let result = match resp.error {
                Some(err) => Err(McpError::Rpc {
                    code: err.code,
                    message: err.message,
                }),
                None => Ok(resp.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
        IncomingMessage::Request(req) => {
            let reply = match req.method.as_str() {
                methods::PING => JsonRpcResponse::success(req.id, serde_json::json!({})),
                other => {
                    let rpc = McpError::MethodNotFound(other.to_string()).to_rpc_error();
                    JsonRpcResponse::error(req.id, rpc.code, rpc.message)
                }
            };
            match serde_json::to_string(&reply) {
                Ok(json) => {
                    if let Err(e) = io.transport.send(&json).await {
                        tracing::debug!(server = %io.name, error = %e, "Failed to answer server request");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Failed to encode reply"),
            }
        }
        IncomingMessage::Notification(notif) => match notif.method.as_str() {
            methods::TOOLS_LIST_CHANGED => {
                tracing::info!(server = %io.name, "Tool list changed");
                let _ = io.events_tx.send(ClientEvent::ToolsChanged);
            }
            other => tracing::debug!(server = %io.name, method = other, "Ignoring notification"),
        },
    }
}
