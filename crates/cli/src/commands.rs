use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_agent::{
    Blackboard, EventSink, ExecutionContext, Orchestrator, RunResult, Task, TracingSink,
};
use relay_core::config::Config;
use relay_llm::{create_provider, LlmProvider};
use relay_mcp::{load_servers, McpManager, McpServer, StdioTransport};
use relay_tool_runtime::{SafetyGate, ToolRegistry};

use crate::cli::{RunArgs, ServersAction};
use crate::config::CliConfig;
use crate::console::{self, ConsoleSink};

/// Run one task to completion.
pub async fn run(args: RunArgs, config: &Config, cli_config: &CliConfig) -> Result<RunResult> {
    let provider: Arc<dyn LlmProvider> = Arc::from(
        create_provider(&config.llm).context("failed to create LLM provider")?,
    );
    let working_dir = resolve_working_dir(args.working_dir.as_deref())?;

    let mut registry = ToolRegistry::with_builtin_tools(SafetyGate::new(cli_config.safety_policy()));
    let manager = McpManager::from_config(&config.mcp);
    if !args.no_mcp {
        connect_servers(&manager, &config.mcp.servers_file).await?;
        registry.add_remote(Arc::new(manager.clone()));
    }
    let roles = cli_config.role_permissions(&manager.auto_approved_keys());

    let mut loop_config = config.run.clone();
    if let Some(max_steps) = args.max_steps {
        loop_config.max_steps = max_steps;
    }

    let events: Arc<dyn EventSink> = if args.json {
        Arc::new(TracingSink)
    } else {
        Arc::new(ConsoleSink)
    };

    let orchestrator = Orchestrator::new(provider, Arc::new(registry))
        .with_roles(Arc::new(roles))
        .with_config(loop_config)
        .with_budget(config.budget.clone())
        .with_events(events)
        .with_model(config.llm.active_model());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            on_interrupt.cancel();
        }
    });

    let mut task = Task::new(args.task, args.role);
    let mut ctx = ExecutionContext::for_task(&task)
        .with_cancel(cancel)
        .with_working_directory(working_dir);
    if let Some(plan_id) = args.plan {
        ctx = ctx.with_plan(plan_id, Arc::new(Blackboard::from_config(&config.blackboard)));
    }

    info!(task_id = %task.id, role = %task.assigned_role, "Starting task");
    let result = orchestrator.run(&mut task, &ctx).await;
    manager.reset();
    let result = result.context("task could not be started")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        console::print_result(&result)?;
    }
    Ok(result)
}

/// List configured tool servers, optionally connecting to each first.
pub async fn servers(action: ServersAction, config: &Config) -> Result<()> {
    let manager = McpManager::from_config(&config.mcp);
    match action {
        ServersAction::List => {
            let records = load_servers(&config.mcp.servers_file).with_context(|| {
                format!("failed to load servers: {}", config.mcp.servers_file.display())
            })?;
            manager.load(records);
        }
        ServersAction::Check => connect_servers(&manager, &config.mcp.servers_file).await?,
    }
    console::print_servers(&manager.servers())?;
    manager.reset();
    Ok(())
}

/// Expose the local tools over stdin/stdout until the peer hangs up.
pub async fn serve(working_dir: Option<PathBuf>, cli_config: &CliConfig) -> Result<()> {
    let working_dir = resolve_working_dir(working_dir.as_deref())?;
    let registry = ToolRegistry::with_builtin_tools(SafetyGate::new(cli_config.safety_policy()));
    info!(tools = registry.len(), dir = %working_dir.display(), "Serving local tools on stdio");

    let mut server = McpServer::new(Arc::new(registry)).with_working_directory(working_dir);
    let mut transport = StdioTransport::new();
    server.run(&mut transport).await.context("tool server failed")?;
    Ok(())
}

async fn connect_servers(manager: &McpManager, servers_file: &Path) -> Result<()> {
    let records = load_servers(servers_file)
        .with_context(|| format!("failed to load servers: {}", servers_file.display()))?;
    if records.is_empty() {
        return Ok(());
    }
    manager.load(records);
    // Failed servers keep retrying in the background; the run goes on without them.
    for (server, err) in manager.connect_all().await {
        warn!(server = %server, error = %err, "Tool server unavailable");
    }
    Ok(())
}

fn resolve_working_dir(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().context("could not determine current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("invalid working directory: {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_working_dir_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_working_dir(Some(dir.path())).unwrap();
        assert!(resolved.is_absolute());

        let missing = dir.path().join("nope");
        let err = resolve_working_dir(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("invalid working directory"));
    }

    #[tokio::test]
    async fn test_connect_without_servers_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = McpManager::from_config(&relay_core::config::McpConfig::default());
        connect_servers(&manager, &dir.path().join("servers.json")).await.unwrap();
        assert!(manager.servers().is_empty());
    }
}
