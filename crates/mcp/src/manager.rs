//! Connection manager for external tool servers.
//!
//! Owns one [`McpClient`] per configured server, namespaces their tools as
//! `serverId::name`, refreshes catalogs on `list_changed`, and reconnects
//! with exponential backoff after an unexpected disconnect. Reconnect timers
//! run on their own tasks; callers of a disconnected server get an immediate
//! "not connected" result.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_tool_runtime::{
    redact_secrets, split_key, RemoteToolSource, ToolDefinition, ToolFailure,
    ToolInvocationResult,
};

use crate::client::{ClientEvent, McpClient};
use crate::config::ServerRecord;
use crate::error::McpError;
use crate::transport::{DefaultTransportFactory, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub tool_count: usize,
    pub last_error: Option<String>,
    /// Delay of the currently scheduled reconnect, if any.
    pub next_retry_in: Option<Duration>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            tool_count: 0,
            last_error: None,
            next_retry_in: None,
        }
    }
}

/// Row for `relay servers` and similar listings.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub transport: &'static str,
    pub enabled: bool,
    pub state: ConnectionState,
}

/// `base * 2^(attempt-1)` for attempts `1..=max_attempts`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` past the ceiling.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 5)
    }
}

struct ServerEntry {
    record: ServerRecord,
    state: ConnectionState,
    client: Option<Arc<McpClient>>,
    /// Bumped on every connect attempt and on disconnect; stale tasks compare it.
    generation: u64,
    /// Set by an explicit disconnect; blocks automatic reconnects.
    disposed: bool,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ServerEntry {
    fn new(record: ServerRecord) -> Self {
        Self {
            record,
            state: ConnectionState::new(),
            client: None,
            generation: 0,
            disposed: false,
            reconnect_task: None,
        }
    }

    fn stop(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if let Some(client) = self.client.take() {
            client.shutdown();
        }
        self.state.next_retry_in = None;
    }
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    backoff: BackoffPolicy,
    request_timeout: Duration,
    servers: Mutex<HashMap<String, ServerEntry>>,
}

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct McpManager {
    inner: Arc<Inner>,
}

impl McpManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        backoff: BackoffPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                backoff,
                request_timeout,
                servers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &relay_core::config::McpConfig) -> Self {
        Self::new(
            Arc::new(DefaultTransportFactory::new()),
            BackoffPolicy::new(
                Duration::from_millis(config.reconnect_base_ms),
                config.max_reconnect_attempts,
            ),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Register server records. Existing entries with the same id are
    /// disconnected and replaced.
    pub fn load(&self, records: Vec<ServerRecord>) {
        let mut servers = self.inner.lock();
        for record in records {
            if let Some(mut old) = servers.remove(&record.id) {
                old.stop();
            }
            servers.insert(record.id.clone(), ServerEntry::new(record));
        }
    }

    /// Connect every enabled, auto-connect server in parallel.
    /// Returns the ids that failed their first attempt.
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        let ids: Vec<String> = {
            let servers = self.inner.lock();
            let mut ids: Vec<String> = servers
                .values()
                .filter(|e| e.record.enabled && e.record.auto_connect)
                .map(|e| e.record.id.clone())
                .collect();
            ids.sort();
            ids
        };

        let attempts = ids.into_iter().map(|id| async move {
            let res = self.connect(&id).await;
            (id, res)
        });
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(id, res)| res.err().map(|e| (id, e)))
            .collect()
    }

    /// Connect (or reconnect) one server, clearing any terminal error and
    /// the disposed flag. A failure schedules backoff reconnects.
    pub async fn connect(&self, server_id: &str) -> Result<(), McpError> {
        {
            let mut servers = self.inner.lock();
            let entry = servers
                .get_mut(server_id)
                .ok_or_else(|| McpError::NotConnected(server_id.to_string()))?;
            if !entry.record.enabled {
                return Err(McpError::Config(format!("server '{server_id}' is disabled")));
            }
            entry.stop();
            entry.disposed = false;
            entry.state.reconnect_attempts = 0;
            entry.state.last_error = None;
        }
        self.inner.clone().attempt(server_id.to_string()).await
    }

    /// Tear down a server connection. No reconnect follows until `connect`.
    pub fn disconnect(&self, server_id: &str) {
        let mut servers = self.inner.lock();
        if let Some(entry) = servers.get_mut(server_id) {
            entry.disposed = true;
            entry.generation += 1;
            entry.stop();
            entry.state = ConnectionState::new();
            tracing::info!(server = server_id, "Disconnected");
        }
    }

    /// Disconnect everything and forget all records.
    pub fn reset(&self) {
        let mut servers = self.inner.lock();
        for entry in servers.values_mut() {
            entry.disposed = true;
            entry.stop();
        }
        servers.clear();
    }

    pub fn state(&self, server_id: &str) -> Option<ConnectionState> {
        self.inner.lock().get(server_id).map(|e| e.state.clone())
    }

    /// All servers sorted by id.
    pub fn servers(&self) -> Vec<ServerSummary> {
        let servers = self.inner.lock();
        let mut rows: Vec<ServerSummary> = servers
            .values()
            .map(|e| ServerSummary {
                id: e.record.id.clone(),
                name: e.record.display_name().to_string(),
                transport: e.record.transport.kind(),
                enabled: e.record.enabled,
                state: e.state.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Qualified keys of connected tools listed in their server's `autoApprove`.
    pub fn auto_approved_keys(&self) -> Vec<String> {
        self.connected_definitions()
            .into_iter()
            .filter(|d| d.auto_approve)
            .map(|d| d.key)
            .collect()
    }

    fn connected_definitions(&self) -> Vec<ToolDefinition> {
        let servers = self.inner.lock();
        let mut ids: Vec<&String> = servers.keys().collect();
        ids.sort();
        let mut defs = Vec::new();
        for id in ids {
            let Some(entry) = servers.get(id) else { continue };
            if entry.state.status != ConnectionStatus::Connected {
                continue;
            }
            if let Some(client) = &entry.client {
                defs.extend(client.tools().iter().map(|t| {
                    t.to_definition(&entry.record.id, entry.record.is_auto_approved(&t.name))
                }));
            }
        }
        defs
    }

    fn connected_client(&self, server_id: &str) -> Result<Arc<McpClient>, McpError> {
        let servers = self.inner.lock();
        match servers.get(server_id) {
            Some(entry) if entry.state.status == ConnectionStatus::Connected => entry
                .client
                .clone()
                .ok_or_else(|| McpError::NotConnected(server_id.to_string())),
            _ => Err(McpError::NotConnected(server_id.to_string())),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServerEntry>> {
        self.servers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One connection attempt. On failure, hands off to the backoff scheduler.
    async fn attempt(self: Arc<Self>, server_id: String) -> Result<(), McpError> {
        let (record, generation) = {
            let mut servers = self.lock();
            let entry = servers
                .get_mut(&server_id)
                .ok_or_else(|| McpError::NotConnected(server_id.clone()))?;
            entry.generation += 1;
            entry.state.status = ConnectionStatus::Connecting;
            entry.state.next_retry_in = None;
            (entry.record.expanded(), entry.generation)
        };

        tracing::info!(
            server = %server_id,
            transport = record.transport.kind(),
            "Connecting to MCP server"
        );

        let outcome = match self.factory.open(&record).await {
            Ok(transport) => {
                McpClient::connect(server_id.clone(), transport, self.request_timeout).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((client, events)) => {
                let client = Arc::new(client);
                let tool_count = client.tools().len();
                {
                    let mut servers = self.lock();
                    let current = servers
                        .get_mut(&server_id)
                        .filter(|e| e.generation == generation && !e.disposed);
                    let Some(entry) = current else {
                        client.shutdown();
                        return Err(McpError::NotConnected(server_id));
                    };
                    entry.client = Some(client.clone());
                    entry.state.status = ConnectionStatus::Connected;
                    entry.state.reconnect_attempts = 0;
                    entry.state.tool_count = tool_count;
                    entry.state.last_error = None;
                }
                tracing::info!(server = %server_id, tools = tool_count, "MCP server connected");
                tokio::spawn(self.clone().watch(server_id, generation, client, events));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "MCP connection failed");
                self.schedule_reconnect(&server_id, generation, e.to_string());
                Err(e)
            }
        }
    }

    /// React to events from one client until it closes.
    async fn watch(
        self: Arc<Self>,
        server_id: String,
        generation: u64,
        client: Arc<McpClient>,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::ToolsChanged => match client.refresh_tools().await {
                    Ok(count) => {
                        let mut servers = self.lock();
                        if let Some(entry) = servers.get_mut(&server_id) {
                            if entry.generation == generation {
                                entry.state.tool_count = count;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %server_id, error = %e, "Tool refresh failed");
                    }
                },
                ClientEvent::Closed { reason } => {
                    {
                        let mut servers = self.lock();
                        if let Some(entry) = servers.get_mut(&server_id) {
                            if entry.generation == generation {
                                entry.client = None;
                            }
                        }
                    }
                    self.schedule_reconnect(&server_id, generation, reason);
                    return;
                }
            }
        }
    }

    /// Arm the next backoff timer, or enter the terminal error state once
    /// the attempt ceiling is reached.
    fn schedule_reconnect(self: &Arc<Self>, server_id: &str, generation: u64, reason: String) {
        let mut servers = self.lock();
        let Some(entry) = servers.get_mut(server_id) else {
            return;
        };
        if entry.disposed || entry.generation != generation {
            return;
        }

        entry.state.last_error = Some(reason);
        let attempt = entry.state.reconnect_attempts + 1;
        let Some(delay) = self.backoff.delay_for(attempt) else {
            entry.state.status = ConnectionStatus::Error;
            entry.state.next_retry_in = None;
            tracing::error!(
                server = server_id,
                attempts = entry.state.reconnect_attempts,
                "Giving up on MCP server until reconnected explicitly"
            );
            return;
        };

        entry.state.reconnect_attempts = attempt;
        entry.state.status = ConnectionStatus::Reconnecting;
        entry.state.next_retry_in = Some(delay);
        tracing::info!(server = server_id, attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let inner = self.clone();
        let id = server_id.to_string();
        entry.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = {
                let servers = inner.lock();
                servers
                    .get(&id)
                    .is_some_and(|e| e.generation == generation && !e.disposed)
            };
            if still_current {
                let _ = inner.attempt(id).await;
            }
        }));
    }
}

#[async_trait]
impl RemoteToolSource for McpManager {
    async fn definitions(&self) -> Vec<ToolDefinition> {
        self.connected_definitions()
    }

    async fn handles(&self, server_id: &str) -> bool {
        self.inner.lock().contains_key(server_id)
    }

    async fn call_tool(
        &self,
        tool_key: &str,
        args: Value,
        cancel: Option<&CancellationToken>,
    ) -> ToolInvocationResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;
        let (Some(server_id), name) = split_key(tool_key) else {
            return ToolInvocationResult::failed(
                tool_key,
                ToolFailure::UnknownTool,
                format!("'{tool_key}' is not a server-qualified tool key"),
                0,
            );
        };

        let client = match self.connected_client(server_id) {
            Ok(c) => c,
            Err(e) => {
                return ToolInvocationResult::failed(tool_key, ToolFailure::NotConnected, e.to_string(), 0)
            }
        };

        tracing::debug!(tool = %tool_key, "Calling remote tool");
        match client.call_tool(name, args, cancel).await {
            Ok(result) if !result.is_error => {
                ToolInvocationResult::ok(tool_key, result.joined_text(), elapsed())
            }
            Ok(result) => ToolInvocationResult::failed(
                tool_key,
                ToolFailure::Execution,
                result.joined_text(),
                elapsed(),
            ),
            Err(e) => {
                tracing::warn!(tool = %tool_key, error = %redact_secrets(&e.to_string()), "Remote tool call failed");
                let failure = if e.is_connection_loss() {
                    ToolFailure::NotConnected
                } else {
                    ToolFailure::Execution
                };
                ToolInvocationResult::failed(tool_key, failure, e.to_string(), elapsed())
            }
        }
    }
}
