//! MCP transport layer.
//!
//! Defines the `McpTransport` trait for sending/receiving JSON-RPC messages
//! and the concrete transports a server record can select:
//!
//! - [`StdioTransport`]: this process's own stdin/stdout (server side)
//! - [`ChildProcessTransport`]: a spawned subprocess speaking newline-delimited JSON
//! - [`SseTransport`]: legacy HTTP+SSE (`endpoint` event, then POST)
//! - [`StreamableHttpTransport`]: POST per message, JSON or SSE response body
//! - [`ChannelTransport`]: in-memory pair for tests and loopback

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::{Event as SseEvent, Eventsource};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{ServerRecord, TransportConfig};
use crate::error::McpError;
use crate::types::{error_codes, JsonRpcResponse, RpcId};

const INBOUND_CAPACITY: usize = 64;
const SESSION_HEADER: &str = "mcp-session-id";

/// Trait for MCP message transport.
///
/// `receive` must be cancel-safe: the client polls it inside `select!`.
#[async_trait]
pub trait McpTransport: Send {
    /// Read the next JSON-RPC message from the transport.
    /// Returns `None` when the transport is closed.
    async fn receive(&mut self) -> Result<Option<String>, McpError>;

    /// Write a JSON-RPC message to the transport.
    async fn send(&mut self, message: &str) -> Result<(), McpError>;

    /// Release the underlying connection or process.
    async fn close(&mut self) -> Result<(), McpError> {
        Ok(())
    }
}

// ── Stdio (server side) ─────────────────────────────────────────────

/// Stdio-based transport using newline-delimited JSON.
///
/// Reads from stdin, writes to stdout. Each message is a single JSON
/// object terminated by a newline character.
pub struct StdioTransport {
    lines: Option<mpsc::Receiver<String>>,
    writer: tokio::io::Stdout,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            lines: None,
            writer: tokio::io::stdout(),
        }
    }

    fn lines(&mut self) -> &mut mpsc::Receiver<String> {
        self.lines.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            tokio::spawn(pump_lines(BufReader::new(tokio::io::stdin()), tx, "stdin"));
            rx
        })
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.lines().recv().await)
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Forward JSON lines from `reader` into `tx` until EOF.
/// Blank lines and lines that are not JSON objects are skipped.
async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>, source: &'static str)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
                    tracing::debug!(source, line = %trimmed, "Skipping non-JSON line");
                    continue;
                }
                if tx.send(trimmed.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(source, error = %e, "Read failed, closing");
                break;
            }
        }
    }
}

// ── Child process (client side) ─────────────────────────────────────

/// A subprocess MCP server over its stdin/stdout.
pub struct ChildProcessTransport {
    label: String,
    stdin: ChildStdin,
    inbound: mpsc::Receiver<String>,
    child: Child,
}

impl ChildProcessTransport {
    /// Spawn `command` with `args` and extra environment.
    /// The child is killed when the transport is dropped.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&PathBuf>,
    ) -> Result<Self, McpError> {
        tracing::debug!(
            command,
            args = ?args,
            env = ?masked_env(env),
            "Spawning MCP server process"
        );

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ServerUnavailable(format!("{command}: no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ServerUnavailable(format!("{command}: no stdout")))?;

        if let Some(stderr) = child.stderr.take() {
            let label = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %label, "stderr: {}", line);
                }
            });
        }

        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(pump_lines(BufReader::new(stdout), tx, "child stdout"));

        Ok(Self {
            label: command.to_string(),
            stdin,
            inbound,
            child,
        })
    }
}

#[async_trait]
impl McpTransport for ChildProcessTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        let line = self.inbound.recv().await;
        if line.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                tracing::info!(server = %self.label, %status, "MCP server process exited");
            }
        }
        Ok(line)
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.stdin.write_all(message.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

fn masked_env(env: &HashMap<String, String>) -> HashMap<&str, &str> {
    env.iter()
        .map(|(k, v)| {
            let upper = k.to_ascii_uppercase();
            let secret = ["KEY", "TOKEN", "SECRET", "PASSWORD"]
                .iter()
                .any(|m| upper.contains(m));
            (k.as_str(), if secret { "***" } else { v.as_str() })
        })
        .collect()
}

// ── Server-sent events ──────────────────────────────────────────────

/// Decode a `text/event-stream` body into events. Chunks may split lines or
/// characters anywhere.
pub fn sse_events<S, B, E>(body: S) -> impl Stream<Item = Result<SseEvent, McpError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    body.eventsource()
        .map(|event| event.map_err(|e| McpError::ServerUnavailable(format!("SSE stream: {e}"))))
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McpError::Config(format!("invalid value for header '{name}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn parse_url(raw: &str) -> Result<Url, McpError> {
    Url::parse(raw).map_err(|e| McpError::Config(format!("invalid url '{raw}': {e}")))
}

/// Legacy HTTP+SSE transport.
///
/// A long-lived GET stream carries server messages; its first `endpoint`
/// event names the URL that client messages are POSTed to.
pub struct SseTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    endpoint: Url,
    inbound: mpsc::Receiver<String>,
    reader: JoinHandle<()>,
}

impl SseTransport {
    pub async fn connect(
        client: reqwest::Client,
        url: &str,
        headers: &HashMap<String, String>,
        handshake_timeout: Duration,
    ) -> Result<Self, McpError> {
        let base = parse_url(url)?;
        let headers = header_map(headers)?;

        let response = client
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(McpError::ServerUnavailable(format!(
                "SSE stream returned HTTP {}",
                response.status()
            )));
        }

        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let events = sse_events(response.bytes_stream());
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "SSE stream read failed");
                        break;
                    }
                };
                match event.event.as_str() {
                    "endpoint" => {
                        if let Some(sender) = endpoint_tx.take() {
                            let _ = sender.send(event.data);
                        }
                    }
                    "message" => {
                        if tx.send(event.data).await.is_err() {
                            return;
                        }
                    }
                    other => tracing::debug!(event = other, "Ignoring SSE event"),
                }
            }
            tracing::debug!("SSE stream ended");
        });

        let endpoint = match tokio::time::timeout(handshake_timeout, endpoint_rx).await {
            Ok(Ok(path)) => base
                .join(&path)
                .map_err(|e| McpError::ServerUnavailable(format!("bad endpoint '{path}': {e}")))?,
            Ok(Err(_)) => {
                return Err(McpError::ServerUnavailable(
                    "SSE stream closed before endpoint event".into(),
                ))
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::Timeout(handshake_timeout));
            }
        };
        tracing::debug!(endpoint = %endpoint, "SSE endpoint resolved");

        Ok(Self {
            client,
            headers,
            endpoint,
            inbound,
            reader,
        })
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(McpError::ServerUnavailable(format!(
                "POST {} returned HTTP {}",
                self.endpoint,
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        self.reader.abort();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Streamable HTTP transport: every client message is its own POST, and the
/// response body (JSON or an SSE stream) carries the server's replies.
pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Arc<Mutex<Option<String>>>,
    inbound_tx: mpsc::Sender<String>,
    inbound: mpsc::Receiver<String>,
}

impl StreamableHttpTransport {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        Ok(Self {
            client,
            url: parse_url(url)?,
            headers: header_map(headers)?,
            session_id: Arc::new(Mutex::new(None)),
            inbound_tx,
            inbound,
        })
    }

    /// Session id assigned by the server on `initialize`, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(id) = self.session_id() {
            if let Ok(value) = HeaderValue::from_str(&id) {
                headers.insert(SESSION_HEADER, value);
            }
        }
        headers
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.inbound.recv().await)
    }

    /// Dispatches the POST in the background so a slow tool call does not
    /// hold up other requests. Failures come back as error responses.
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        let request = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(message.to_string());
        let request_id = serde_json::from_str::<serde_json::Value>(message)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .and_then(|id| serde_json::from_value::<RpcId>(id).ok());
        let session = self.session_id.clone();
        let tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = post_and_forward(request, session, &tx).await {
                tracing::warn!(error = %e, "Streamable HTTP request failed");
                if let Some(id) = request_id {
                    let reply = JsonRpcResponse::error(id, error_codes::INTERNAL_ERROR, e.to_string());
                    if let Ok(json) = serde_json::to_string(&reply) {
                        let _ = tx.send(json).await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        if self.session_id().is_some() {
            let _ = self
                .client
                .delete(self.url.clone())
                .headers(self.request_headers())
                .send()
                .await;
        }
        Ok(())
    }
}

async fn post_and_forward(
    request: reqwest::RequestBuilder,
    session: Arc<Mutex<Option<String>>>,
    tx: &mpsc::Sender<String>,
) -> Result<(), McpError> {
    let response = request.send().await?;

    if let Some(id) = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if let Ok(mut slot) = session.lock() {
            *slot = Some(id.to_string());
        }
    }

    let status = response.status();
    if !status.is_success() {
        return Err(McpError::ServerUnavailable(format!("HTTP {status}")));
    }
    if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
        return Ok(());
    }

    let is_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_stream {
        let events = sse_events(response.bytes_stream());
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            forward_body(&event?.data, tx).await;
        }
    } else {
        let body = response.text().await?;
        forward_body(&body, tx).await;
    }
    Ok(())
}

/// Forward a JSON body, unpacking batch arrays into single messages.
async fn forward_body(body: &str, tx: &mpsc::Sender<String>) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Array(items)) => {
            for item in items {
                let _ = tx.send(item.to_string()).await;
            }
        }
        Ok(_) => {
            let _ = tx.send(body.to_string()).await;
        }
        Err(e) => tracing::debug!(error = %e, "Dropping non-JSON HTTP body"),
    }
}

// ── In-memory ───────────────────────────────────────────────────────

/// In-memory transport for testing, backed by channel pairs.
pub struct ChannelTransport {
    rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<String>,
}

impl ChannelTransport {
    /// Create a pair of connected transports.
    ///
    /// Messages sent on one transport are received by the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(32);
        let (tx_b, rx_a) = mpsc::channel(32);
        (Self { rx: rx_a, tx: tx_a }, Self { rx: rx_b, tx: tx_b })
    }
}

#[async_trait]
impl McpTransport for ChannelTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.tx.send(message.to_string()).await.map_err(|e| {
            McpError::Transport(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
        })?;
        Ok(())
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Opens a transport for a server record.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, record: &ServerRecord) -> Result<Box<dyn McpTransport>, McpError>;
}

/// Chooses the transport named by the record's config.
pub struct DefaultTransportFactory {
    http: reqwest::Client,
    working_dir: Option<PathBuf>,
    handshake_timeout: Duration,
}

impl DefaultTransportFactory {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            working_dir: None,
            handshake_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(&self, record: &ServerRecord) -> Result<Box<dyn McpTransport>, McpError> {
        match &record.transport {
            TransportConfig::Stdio { command, args, env } => Ok(Box::new(
                ChildProcessTransport::spawn(command, args, env, self.working_dir.as_ref())?,
            )),
            TransportConfig::Sse { url, headers } => Ok(Box::new(
                SseTransport::connect(self.http.clone(), url, headers, self.handshake_timeout)
                    .await?,
            )),
            TransportConfig::StreamableHttp { url, headers } => Ok(Box::new(
                StreamableHttpTransport::new(self.http.clone(), url, headers)?,
            )),
        }
    }
}
