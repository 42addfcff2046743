use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::safety::{redact_secrets, SafetyGate};
use crate::tool::{
    qualify, split_key, Tool, ToolContext, ToolDefinition, ToolError, ToolFailure,
    ToolInvocationResult, LOCAL_SERVER_ID,
};

/// A provider of tools that live outside this process.
///
/// Implementations must never fail across this boundary: transport and
/// protocol errors are folded into the returned [`ToolInvocationResult`].
#[async_trait]
pub trait RemoteToolSource: Send + Sync {
    /// Current catalog, keys already namespaced by server id.
    async fn definitions(&self) -> Vec<ToolDefinition>;

    /// Whether this source owns tools for `server_id`.
    async fn handles(&self, server_id: &str) -> bool;

    async fn call_tool(
        &self,
        tool_key: &str,
        args: Value,
        cancel: Option<&CancellationToken>,
    ) -> ToolInvocationResult;
}

/// Resolves tool keys to local tools or remote sources and invokes them.
///
/// Local tools are run past the [`SafetyGate`] before executing.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    remote: Vec<Arc<dyn RemoteToolSource>>,
    safety: SafetyGate,
}

impl ToolRegistry {
    pub fn new(safety: SafetyGate) -> Self {
        Self {
            tools: HashMap::new(),
            remote: Vec::new(),
            safety,
        }
    }

    /// A registry pre-loaded with every built-in local tool.
    pub fn with_builtin_tools(safety: SafetyGate) -> Self {
        let mut registry = Self::new(safety);
        for tool in crate::tools::builtin_tools() {
            let name = tool.definition().key;
            registry.tools.insert(name, Arc::from(tool));
        }
        registry
    }

    /// Register a tool. Returns error if name already registered.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        let name = tool.definition().key;
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.tools.insert(name, Arc::new(tool));
        Ok(())
    }

    /// [`register`](Self::register) for an already boxed tool.
    pub fn register_boxed(&mut self, tool: Box<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.definition().key;
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.tools.insert(name, Arc::from(tool));
        Ok(())
    }

    pub fn add_remote(&mut self, source: Arc<dyn RemoteToolSource>) {
        self.remote.push(source);
    }

    /// Look up a local tool by bare name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn safety(&self) -> &SafetyGate {
        &self.safety
    }

    /// Local tool definitions with bare keys, sorted by name.
    pub fn local_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.key.cmp(&b.key));
        defs
    }

    /// Every callable tool: local ones under `local::`, then each remote catalog.
    pub async fn list(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .local_definitions()
            .into_iter()
            .map(|mut d| {
                d.key = qualify(LOCAL_SERVER_ID, &d.key);
                d
            })
            .collect();
        for source in &self.remote {
            defs.extend(source.definitions().await);
        }
        defs
    }

    /// Number of registered local tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Invoke a tool by key. Never fails: every problem is reported in the result.
    pub async fn call_tool(
        &self,
        tool_key: &str,
        args: Value,
        context: &ToolContext,
    ) -> ToolInvocationResult {
        let (server, name) = split_key(tool_key);
        match server {
            None => self.call_local(tool_key, name, args, context).await,
            Some(LOCAL_SERVER_ID) => self.call_local(tool_key, name, args, context).await,
            Some(server_id) => {
                for source in &self.remote {
                    if source.handles(server_id).await {
                        return source.call_tool(tool_key, args, context.cancel.as_ref()).await;
                    }
                }
                ToolInvocationResult::failed(
                    tool_key,
                    ToolFailure::UnknownTool,
                    format!("Unknown tool server '{server_id}'"),
                    0,
                )
            }
        }
    }

    async fn call_local(
        &self,
        tool_key: &str,
        name: &str,
        args: Value,
        context: &ToolContext,
    ) -> ToolInvocationResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let Some(tool) = self.tools.get(name) else {
            return ToolInvocationResult::failed(
                tool_key,
                ToolFailure::UnknownTool,
                format!("Unknown tool '{name}'"),
                elapsed(),
            );
        };

        match tool.safety_action(&args, context) {
            Ok(Some(action)) => {
                let verdict = self.safety.evaluate(&action);
                if !verdict.allowed {
                    warn!(tool = %tool_key, reason = %verdict.reason, "blocked by safety gate");
                    return ToolInvocationResult::failed(
                        tool_key,
                        ToolFailure::SafetyBlocked,
                        format!("Blocked by safety policy: {}", verdict.reason),
                        elapsed(),
                    );
                }
            }
            Ok(None) => {}
            Err(ToolError::PermissionDenied(msg)) => {
                return ToolInvocationResult::failed(
                    tool_key,
                    ToolFailure::SafetyBlocked,
                    format!("Blocked by safety policy: {msg}"),
                    elapsed(),
                );
            }
            Err(e) => {
                return ToolInvocationResult::failed(tool_key, ToolFailure::Execution, e.to_string(), elapsed());
            }
        }

        debug!(tool = %tool_key, "executing local tool");
        match tool.execute(args, context).await {
            Ok(output) if !output.is_error => ToolInvocationResult::ok(tool_key, output.content, elapsed()),
            Ok(output) => {
                ToolInvocationResult::failed(tool_key, ToolFailure::Execution, output.content, elapsed())
            }
            Err(e) => {
                debug!(tool = %tool_key, error = %redact_secrets(&e.to_string()), "local tool failed");
                ToolInvocationResult::failed(tool_key, ToolFailure::Execution, e.to_string(), elapsed())
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(SafetyGate::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool with name '{0}' is already registered")]
    DuplicateName(String),
}
