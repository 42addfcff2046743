//! End-to-end loop scenarios against a scripted engine and in-process tools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use relay_agent::{
    AgentError, AgentEvent, Blackboard, Confidence, ExecutionContext, MemorySink, Orchestrator,
    Outcome, Task, TaskStatus, TerminationReason, SUMMARY_KEY,
};
use relay_core::config::LoopConfig;
use relay_llm::provider::mock::ScriptedProvider;
use relay_tool_runtime::{
    SafetyAction, SafetyGate, Tool, ToolContext, ToolDefinition, ToolError, ToolFailure,
    ToolOutput, ToolRegistry,
};

/// Search stand-in that counts how often it really ran.
struct CountingSearch {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for CountingSearch {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("search", "Search the corpus", json!({"type": "object"}))
    }

    fn safety_action(&self, _: &Value, _: &ToolContext) -> Result<Option<SafetyAction>, ToolError> {
        Ok(None)
    }

    async fn execute(&self, input: Value, _: &ToolContext) -> Result<ToolOutput, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::text(format!("3 hits for {}", input["q"])))
    }
}

/// Cancels the run's token while executing.
struct CancellingTool {
    token: CancellationToken,
}

#[async_trait]
impl Tool for CancellingTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("stop_everything", "Cancels the task", json!({"type": "object"}))
    }

    fn safety_action(&self, _: &Value, _: &ToolContext) -> Result<Option<SafetyAction>, ToolError> {
        Ok(None)
    }

    async fn execute(&self, _: Value, _: &ToolContext) -> Result<ToolOutput, ToolError> {
        self.token.cancel();
        Ok(ToolOutput::text("cancelled"))
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new("slow_job", "Takes a while", json!({"type": "object"}))
    }

    fn safety_action(&self, _: &Value, _: &ToolContext) -> Result<Option<SafetyAction>, ToolError> {
        Ok(None)
    }

    async fn execute(&self, _: Value, _: &ToolContext) -> Result<ToolOutput, ToolError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(ToolOutput::text("done"))
    }
}

fn registry_with(tools: Vec<Box<dyn Tool>>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::with_builtin_tools(SafetyGate::default());
    for tool in tools {
        registry.register_boxed(tool).unwrap();
    }
    Arc::new(registry)
}

fn search_registry() -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry_with(vec![Box::new(CountingSearch { calls: calls.clone() })]);
    (registry, calls)
}

fn orchestrator(provider: &Arc<ScriptedProvider>, registry: Arc<ToolRegistry>) -> Orchestrator {
    Orchestrator::new(provider.clone(), registry)
}

#[tokio::test]
async fn test_identical_calls_trip_loop_detection() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_repeated(r#"{"tool": "search", "args": {"q": "x"}}"#, 3);
    provider.queue("Searched twice for x and found 3 hits each time.");
    let (registry, calls) = search_registry();

    let mut task = Task::new("find x", "admin");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry).run(&mut task, &ctx).await.unwrap();

    assert!(result.loop_detected);
    assert!(matches!(result.termination, TerminationReason::LoopDetected { .. }));
    assert_eq!(result.outcome, Outcome::Partial);
    assert_eq!(result.confidence, Confidence::Medium);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.successful_calls(), 2);
    assert_eq!(result.summary, "Searched twice for x and found 3 hits each time.");

    // The closing summary call forbids tools.
    let last = provider.calls().pop().unwrap();
    assert!(last.system_prompt.contains("Tools are no longer available"));
}

#[tokio::test]
async fn test_qualified_and_bare_keys_share_loop_detection() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "search", "args": {"q": "x"}}"#);
    provider.queue(r#"{"tool": "local::search", "args": {"q": "x"}}"#);
    provider.queue(r#"{"tool": "search", "args": {"q": "x"}}"#);
    provider.queue("Searched twice for x.");
    let (registry, calls) = search_registry();

    let mut task = Task::new("find x", "admin");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry).run(&mut task, &ctx).await.unwrap();

    assert!(result.loop_detected);
    assert_eq!(result.outcome, Outcome::Partial);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.summary, "Searched twice for x.");
}

#[tokio::test]
async fn test_summary_that_still_calls_a_tool_falls_back_to_local() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_repeated(r#"{"tool": "search", "args": {"q": "x"}}"#, 4);
    let (registry, _) = search_registry();

    let mut task = Task::new("find x", "admin");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry).run(&mut task, &ctx).await.unwrap();

    assert!(result.summary.contains("loop detected"));
    assert!(result.summary.contains("2 of 2 tool calls succeeded"));
}

#[tokio::test]
async fn test_repeated_read_is_served_from_working_set() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "a\nb\nc\n").unwrap();

    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "local::file_read", "args": {"path": "notes.txt"}}"#);
    provider.queue(r#"{"tool": "file_read", "args": {"path": "./notes.txt", "offset": 2, "limit": 1}}"#);
    provider.queue(r#"{"done": true, "summary": "three lines"}"#);

    let mut task = Task::new("read the notes", "executor");
    let ctx = ExecutionContext::for_task(&task).with_working_directory(dir.path());
    let result = orchestrator(&provider, registry_with(vec![]))
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.tool_calls.len(), 2);
    assert_eq!(result.invocations(), 1);
    assert!(result.tool_calls[1].cached);
    assert_eq!(result.tool_calls[1].content, "     2\tb");
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.confidence, Confidence::High);
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_delegation_invalidates_parent_working_set() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "old\n").unwrap();

    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "file_read", "args": {"path": "notes.txt"}}"#);
    provider.queue(r#"{"tool": "delegate_task", "args": {"role": "executor", "task": "rewrite the notes"}}"#);
    provider.queue(r#"{"tool": "file_write", "args": {"path": "notes.txt", "content": "new\n"}}"#);
    provider.queue(r#"{"done": true, "summary": "notes rewritten"}"#);
    provider.queue(r#"{"tool": "file_read", "args": {"path": "notes.txt"}}"#);
    provider.queue(r#"{"done": true, "summary": "notes now say new"}"#);

    let mut task = Task::new("refresh the notes", "executor");
    let ctx = ExecutionContext::for_task(&task).with_working_directory(dir.path());
    let result = orchestrator(&provider, registry_with(vec![]))
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.tool_calls.len(), 3);
    assert!(result.tool_calls[1].success);
    let reread = &result.tool_calls[2];
    assert!(!reread.cached);
    assert!(reread.content.contains("new"));
    assert!(!reread.content.contains("old"));
    assert_eq!(result.summary, "notes now say new");
}

#[tokio::test]
async fn test_read_tier_cannot_execute_shell() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "local::shell_execute", "args": {"command": "ls"}}"#);
    provider.queue(r#"{"done": true, "summary": "could not run it"}"#);

    let mut task = Task::new("list files", "researcher");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry_with(vec![]))
        .run(&mut task, &ctx)
        .await
        .unwrap();

    let call = &result.tool_calls[0];
    assert!(!call.success);
    assert_eq!(call.failure, Some(ToolFailure::PermissionDenied));
    assert!(call.content.contains("read"));
    assert!(call.content.contains("shell_execute"));
    // No tool succeeded, so explicit completion is only partial.
    assert_eq!(result.outcome, Outcome::Partial);

    // Denied tools are not offered in the first place.
    let first = &provider.calls()[0];
    assert!(!first.system_prompt.contains("local::shell_execute"));
    assert!(first.system_prompt.contains("local::file_read"));
}

#[tokio::test]
async fn test_delegation_stops_at_depth_limit() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "delegate_task", "args": {"role": "admin", "task": "check the logs"}}"#);
    provider.queue(r#"{"tool": "delegate_task", "args": {"role": "admin", "task": "go deeper"}}"#);
    provider.queue(r#"{"done": true, "summary": "logs are clean"}"#);
    provider.queue(r#"{"done": true, "summary": "all good"}"#);

    let events = Arc::new(MemorySink::new());
    let board = Arc::new(Blackboard::new(Duration::from_secs(60), 50));
    let config = LoopConfig {
        max_delegation_depth: 1,
        ..LoopConfig::default()
    };

    let mut task = Task::new("audit the service", "admin");
    let ctx = ExecutionContext::for_task(&task).with_plan("plan-1", board.clone());
    let result = orchestrator(&provider, registry_with(vec![]))
        .with_config(config)
        .with_events(events.clone())
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.summary, "all good");
    let delegated = &result.tool_calls[0];
    assert!(delegated.success);
    assert!(delegated.content.contains("logs are clean"));

    let refused = events.events().into_iter().any(|e| {
        matches!(e, AgentEvent::ToolResult { ref tool, success: false, .. } if tool == "local::delegate_task")
    });
    assert!(refused, "nested delegation should have been refused");

    // Parent and child both published their summaries to the shared plan.
    assert_eq!(board.read("plan-1", SUMMARY_KEY).len(), 2);
}

#[tokio::test]
async fn test_cancelled_before_start_makes_no_engine_calls() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut task = Task::new("anything", "executor");
    let ctx = ExecutionContext::for_task(&task);
    ctx.cancel.cancel();

    let result = orchestrator(&provider, registry_with(vec![]))
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.termination, TerminationReason::Cancelled);
    assert_eq!(result.outcome, Outcome::Partial);
    assert_eq!(result.confidence, Confidence::Low);
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_cancellation_mid_run_stops_without_summary_call() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "stop_everything", "args": {}}"#);

    let mut task = Task::new("run until told to stop", "admin");
    let ctx = ExecutionContext::for_task(&task);
    let registry = registry_with(vec![Box::new(CancellingTool { token: ctx.cancel.clone() })]);

    let result = orchestrator(&provider, registry).run(&mut task, &ctx).await.unwrap();

    assert_eq!(result.termination, TerminationReason::Cancelled);
    assert_eq!(provider.call_count(), 1);
    assert!(result.summary.contains("1 of 1 tool calls succeeded"));
}

#[tokio::test]
async fn test_unparseable_replies_exhaust_corrections() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue("let me think");
    provider.queue("still thinking");
    provider.queue("The answer is 42.");

    let mut task = Task::new("what is the answer", "executor");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry_with(vec![]))
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.termination, TerminationReason::CorrectionsExhausted);
    assert_eq!(result.summary, "The answer is 42.");
    assert_eq!(result.confidence, Confidence::Medium);
    assert_eq!(provider.call_count(), 3);
    assert!(provider.calls()[1].user_prompt.contains("could not be used"));
}

#[tokio::test]
async fn test_step_ceiling_ends_with_summary() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "echo", "args": {"message": "one"}}"#);
    provider.queue(r#"{"tool": "echo", "args": {"message": "two"}}"#);
    provider.queue("Echoed two messages.");

    let config = LoopConfig {
        max_steps: 2,
        ..LoopConfig::default()
    };
    let mut registry = ToolRegistry::new(SafetyGate::default());
    registry.register(relay_tool_runtime::EchoTool).unwrap();

    let mut task = Task::new("echo things", "researcher");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, Arc::new(registry))
        .with_config(config)
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.termination, TerminationReason::StepCeilingReached);
    assert_eq!(result.steps, 2);
    assert_eq!(result.outcome, Outcome::Partial);
    assert_eq!(result.confidence, Confidence::Low);
    assert_eq!(result.summary, "Echoed two messages.");
}

#[tokio::test]
async fn test_repeated_tool_gets_a_warning_first() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "search", "args": {"q": "a"}}"#);
    provider.queue(r#"{"tool": "search", "args": {"q": "b"}}"#);
    provider.queue(r#"{"done": true, "summary": "found it"}"#);

    let config = LoopConfig {
        max_consecutive_same_tool: 2,
        ..LoopConfig::default()
    };
    let (registry, calls) = search_registry();
    let mut task = Task::new("search around", "admin");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry)
        .with_config(config)
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.termination, TerminationReason::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(provider.calls()[2].user_prompt.contains("WARNING"));
    assert!(!provider.calls()[1].user_prompt.contains("WARNING"));
}

#[tokio::test]
async fn test_engine_failure_leaves_task_retrying() {
    let provider = Arc::new(ScriptedProvider::new());
    // Each run retries a transient failure once.
    for _ in 0..4 {
        provider.queue_error("upstream unavailable");
    }

    let events = Arc::new(MemorySink::new());
    let orch = orchestrator(&provider, registry_with(vec![])).with_events(events.clone());
    let mut task = Task::new("do it", "executor");
    let ctx = ExecutionContext::for_task(&task);

    let first = orch.run(&mut task, &ctx).await.unwrap();
    assert_eq!(first.outcome, Outcome::Failed);
    assert!(matches!(first.termination, TerminationReason::EngineFailed { .. }));
    assert_eq!(task.status, TaskStatus::Retrying);
    assert!(events.events().iter().any(|e| matches!(e, AgentEvent::Error { .. })));
    assert!(matches!(events.events().last(), Some(AgentEvent::Completed { .. })));

    orch.run(&mut task, &ctx).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let err = orch.run(&mut task, &ctx).await.unwrap_err();
    assert!(matches!(err, AgentError::AttemptsExhausted { attempts: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_timeout() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "slow_job", "args": {}}"#);
    provider.queue("Started the job; it did not finish in time.");

    let config = LoopConfig {
        timeout_ms: 1_000,
        ..LoopConfig::default()
    };
    let mut task = Task::new("run the job", "admin");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry_with(vec![Box::new(SlowTool)]))
        .with_config(config)
        .run(&mut task, &ctx)
        .await
        .unwrap();

    assert_eq!(result.termination, TerminationReason::TimedOut);
    assert_eq!(result.confidence, Confidence::Low);
    assert_eq!(result.steps, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sub_agent_stops_at_parent_deadline() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue(r#"{"tool": "slow_job", "args": {}}"#);
    provider.queue(r#"{"tool": "delegate_task", "args": {"role": "admin", "task": "finish the job"}}"#);
    provider.queue(r#"{"tool": "slow_job", "args": {}}"#);
    provider.queue("Second run of the job did not finish.");
    provider.queue("The job is still running.");

    // Each run alone may take 3s; the child starts 2s in, so only 1s remains.
    let config = LoopConfig {
        timeout_ms: 3_000,
        ..LoopConfig::default()
    };
    let mut task = Task::new("run the job twice", "admin");
    let ctx = ExecutionContext::for_task(&task);
    let result = orchestrator(&provider, registry_with(vec![Box::new(SlowTool)]))
        .with_config(config)
        .run(&mut task, &ctx)
        .await
        .unwrap();

    let delegated = &result.tool_calls[1];
    assert_eq!(delegated.tool_key, "local::delegate_task");
    assert!(delegated.content.contains("timed out"));
    assert!(delegated.content.contains("Second run of the job did not finish."));
    assert_eq!(result.termination, TerminationReason::TimedOut);
    assert_eq!(result.summary, "The job is still running.");
    assert_eq!(provider.call_count(), 5);
}

#[tokio::test]
async fn test_empty_task_is_rejected() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut task = Task::new("   ", "executor");
    let ctx = ExecutionContext::for_task(&task);
    let err = orchestrator(&provider, registry_with(vec![]))
        .run(&mut task, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidTask(_)));
    assert_eq!(task.attempts, 0);
}
