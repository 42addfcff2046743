//! The orchestration loop: think, decide, act, repeat.
//!
//! One [`Orchestrator`] can drive any number of tasks; each call to
//! [`Orchestrator::run`] is an independent loop that issues at most one
//! engine call and at most one tool call at a time.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_core::config::{BudgetConfig, LoopConfig};
use relay_llm::{LlmError, LlmProvider, ThinkOptions, ThinkResponse};
use relay_tool_runtime::{
    bare_name, is_external, qualify, redact_secrets, PermissionDecision, RolePermissions,
    ToolContext, ToolDefinition, ToolFailure, ToolInvocationResult, ToolRegistry,
    DELEGATE_TOOL_NAME, LOCAL_SERVER_ID,
};

use crate::budget::{estimate_tokens, ContextBudget};
use crate::events::{AgentEvent, EventSink, NullSink};
use crate::loop_guard::{GuardVerdict, LoopGuard};
use crate::parser::{parse_decision, Decision};
use crate::prompt::{self, Turn};
use crate::types::{
    AgentError, ExecutionContext, Outcome, RunResult, Task, TaskStatus, TerminationReason,
    ToolCallRecord,
};
use crate::working_set::WorkingSet;

/// Characters of a tool result kept in the progress section of the prompt.
const STEP_PREVIEW_CHARS: usize = 1_500;
const EVENT_PREVIEW_CHARS: usize = 200;
const WORKING_SET_FILE_CHARS: usize = 12_000;
/// Blackboard key each finished task writes its summary under.
pub const SUMMARY_KEY: &str = "summary";

pub fn delegate_definition() -> ToolDefinition {
    ToolDefinition::new(
        qualify(LOCAL_SERVER_ID, DELEGATE_TOOL_NAME),
        "Hand a self-contained sub-task to an agent with another role and get its result back.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "role": { "type": "string", "description": "Role that should do the work" },
                "task": { "type": "string", "description": "What the sub-agent should do" },
                "share": {
                    "type": "boolean",
                    "description": "Share this plan's blackboard with the sub-agent (default true)"
                }
            },
            "required": ["role", "task"]
        }),
    )
}

fn is_delegation(tool_key: &str) -> bool {
    !is_external(tool_key) && bare_name(tool_key) == DELEGATE_TOOL_NAME
}

/// Mutable state of one run.
struct RunState {
    step: u32,
    records: Vec<ToolCallRecord>,
    /// Progress entries shown to the engine; compaction may shorten them.
    history: Vec<String>,
    working_set: WorkingSet,
    /// Own timeout, capped by any deadline inherited from a parent run.
    deadline: Instant,
    guard: LoopGuard,
    warning: Option<String>,
    correction: Option<String>,
    corrections: u32,
    summary: String,
    last_raw: String,
    tokens_in: u64,
    tokens_out: u64,
    model: String,
}

impl RunState {
    fn account(&mut self, response: &ThinkResponse) {
        self.tokens_in += u64::from(response.tokens_in);
        self.tokens_out += u64::from(response.tokens_out);
        if !response.model.is_empty() {
            self.model = response.model.clone();
        }
    }
}

pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    roles: Arc<RolePermissions>,
    config: LoopConfig,
    budget: ContextBudget,
    events: Arc<dyn EventSink>,
    model: String,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn LlmProvider>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            provider,
            registry,
            roles: Arc::new(RolePermissions::builtin()),
            config: LoopConfig::default(),
            budget: ContextBudget::new(BudgetConfig::default()),
            events: Arc::new(NullSink),
            model: String::new(),
        }
    }

    pub fn with_roles(mut self, roles: Arc<RolePermissions>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_budget(mut self, config: BudgetConfig) -> Self {
        self.budget = ContextBudget::new(config);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Model name used for context-window lookup until the engine reports one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Drive `task` to a terminal result.
    ///
    /// Errors only when the task cannot start; once started, every path ends
    /// in a [`RunResult`].
    pub async fn run(&self, task: &mut Task, ctx: &ExecutionContext) -> Result<RunResult, AgentError> {
        self.run_boxed(task, ctx).await
    }

    fn run_boxed<'a>(
        &'a self,
        task: &'a mut Task,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<RunResult, AgentError>> {
        Box::pin(self.run_inner(task, ctx))
    }

    async fn run_inner(&self, task: &mut Task, ctx: &ExecutionContext) -> Result<RunResult, AgentError> {
        if task.description.trim().is_empty() {
            return Err(AgentError::InvalidTask(format!("task {} has no description", task.id)));
        }
        if !task.can_retry() {
            return Err(AgentError::AttemptsExhausted {
                task_id: task.id.clone(),
                attempts: task.attempts,
            });
        }
        task.attempts += 1;
        task.status = TaskStatus::InProgress;

        let started = Instant::now();
        let profile = self.roles.get(&task.assigned_role);
        let max_steps = profile
            .and_then(|p| p.max_steps)
            .map(|s| u32::try_from(s).unwrap_or(u32::MAX))
            .unwrap_or(self.config.max_steps);
        let timeout = Duration::from_millis(
            profile.and_then(|p| p.timeout_ms).unwrap_or(self.config.timeout_ms),
        );
        let deadline = ctx.deadline.map_or(started + timeout, |d| d.min(started + timeout));

        let tools = self.visible_tools(&task.assigned_role, ctx.depth).await;
        let system = prompt::system_prompt(&task.assigned_role, &tools);

        info!(
            task_id = %task.id,
            role = %task.assigned_role,
            depth = ctx.depth,
            tools = tools.len(),
            max_steps,
            "starting task"
        );

        let mut state = RunState {
            step: 0,
            records: Vec::new(),
            history: Vec::new(),
            working_set: WorkingSet::new(),
            deadline,
            guard: LoopGuard::from_config(&self.config),
            warning: None,
            correction: None,
            corrections: 0,
            summary: String::new(),
            last_raw: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            model: self.model.clone(),
        };

        let termination = loop {
            if ctx.cancel.is_cancelled() {
                break TerminationReason::Cancelled;
            }
            if Instant::now() >= state.deadline {
                break TerminationReason::TimedOut;
            }
            if state.step >= max_steps {
                break TerminationReason::StepCeilingReached;
            }
            state.step += 1;

            let mut user = self.user_prompt(task, ctx, &state, max_steps);
            let used = estimate_tokens(&system) + estimate_tokens(&user);
            let status = self.budget.budget_for(&state.model, used);
            if status.should_compact {
                let compaction = self.budget.compact(
                    &state.working_set,
                    &state.history,
                    status.excess.max(1),
                    state.step,
                );
                if compaction.tokens_freed > 0 {
                    info!(
                        task_id = %task.id,
                        step = state.step,
                        level = ?compaction.level_applied,
                        freed = compaction.tokens_freed,
                        usage = status.usage_ratio,
                        "compacted context"
                    );
                    state.working_set = compaction.reduced_working_set;
                    state.history = compaction.reduced_history;
                    user = self.user_prompt(task, ctx, &state, max_steps);
                }
            }
            state.warning = None;
            state.correction = None;

            if ctx.cancel.is_cancelled() {
                break TerminationReason::Cancelled;
            }

            self.events.emit(AgentEvent::Thinking {
                task_id: task.id.clone(),
                step: state.step,
            });

            let response = match self.think(&system, &user, ctx).await {
                Ok(response) => response,
                Err(LlmError::Cancelled) => break TerminationReason::Cancelled,
                Err(e) => {
                    break TerminationReason::EngineFailed {
                        message: redact_secrets(&e.to_string()),
                    }
                }
            };
            state.account(&response);
            state.last_raw = response.content.clone();

            match parse_decision(&response.content) {
                Decision::Unparseable { reason } => {
                    state.corrections += 1;
                    debug!(task_id = %task.id, step = state.step, reason = %reason, "unparseable reply");
                    if state.corrections > self.config.max_corrections {
                        break TerminationReason::CorrectionsExhausted;
                    }
                    state.correction = Some(reason);
                }
                Decision::Completion { summary } => {
                    state.summary = summary;
                    break TerminationReason::Completed;
                }
                Decision::ToolCall { tool, args } => {
                    state.corrections = 0;
                    match state.guard.check(&tool, &args) {
                        GuardVerdict::Stop(detail) => {
                            warn!(task_id = %task.id, step = state.step, detail = %detail, "loop detected");
                            break TerminationReason::LoopDetected { detail };
                        }
                        GuardVerdict::Warn(message) => state.warning = Some(message),
                        GuardVerdict::Proceed => {}
                    }

                    self.events.emit(AgentEvent::Acting {
                        task_id: task.id.clone(),
                        step: state.step,
                        action: tool.clone(),
                    });
                    let record = self.act(task, ctx, &mut state, tool, args).await;
                    self.events.emit(AgentEvent::ToolResult {
                        task_id: task.id.clone(),
                        tool: record.tool_key.clone(),
                        success: record.success,
                        summary: prompt::truncate(&record.content, EVENT_PREVIEW_CHARS),
                        step: record.step,
                    });
                    state.history.push(prompt::step_entry(&record, STEP_PREVIEW_CHARS));
                    state.records.push(record);
                }
            }
        };

        Ok(self.finish(task, ctx, state, termination, started).await)
    }

    async fn visible_tools(&self, role: &str, depth: u32) -> Vec<ToolDefinition> {
        let mut all = self.registry.list().await;
        if depth < self.config.max_delegation_depth {
            all.push(delegate_definition());
        }
        match self.roles.get(role) {
            Some(profile) => profile.filter_tools(&all),
            None => Vec::new(),
        }
    }

    fn user_prompt(&self, task: &Task, ctx: &ExecutionContext, state: &RunState, max_steps: u32) -> String {
        let blackboard = match (&ctx.plan_id, &ctx.blackboard) {
            (Some(plan), Some(board)) => board.format_for_prompt(plan, &task.assigned_role, &task.id),
            _ => String::new(),
        };
        let working_set = state.working_set.format_for_prompt(WORKING_SET_FILE_CHARS);
        prompt::user_prompt(
            task,
            ctx,
            &Turn {
                step: state.step,
                max_steps,
                blackboard: &blackboard,
                working_set: &working_set,
                history: &state.history,
                warning: state.warning.as_deref(),
                correction: state.correction.as_deref(),
            },
        )
    }

    /// One engine call, retried once when the failure looks transient.
    async fn think(&self, system: &str, user: &str, ctx: &ExecutionContext) -> Result<ThinkResponse, LlmError> {
        let options = ThinkOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            cancel: Some(ctx.cancel.clone()),
            ..Default::default()
        };
        match self.provider.think(system, user, &options).await {
            Err(e) if e.is_transient() && !ctx.cancel.is_cancelled() => {
                warn!(provider = self.provider.provider_name(), error = %e, "transient engine error, retrying once");
                self.provider.think(system, user, &options).await
            }
            other => other,
        }
    }

    async fn act(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        state: &mut RunState,
        tool: String,
        args: Value,
    ) -> ToolCallRecord {
        let step = state.step;

        if let PermissionDecision::Denied(reason) = self.roles.authorize(&task.assigned_role, &tool) {
            info!(task_id = %task.id, tool = %tool, reason = %reason, "tool call denied");
            return ToolCallRecord {
                step,
                tool_key: tool,
                args,
                success: false,
                content: format!("Permission denied: {reason}"),
                duration_ms: 0,
                failure: Some(ToolFailure::PermissionDenied),
                cached: false,
            };
        }

        if is_delegation(&tool) {
            let (result, tokens_in, tokens_out) = self.delegate(task, ctx, state.deadline, &args).await;
            state.tokens_in += tokens_in;
            state.tokens_out += tokens_out;
            // The sub-agent may have changed files this cache never saw.
            state.working_set.clear();
            return record_from(step, args, result, false);
        }

        if let Some(content) = state.working_set.lookup(&tool, &args, &ctx.working_directory) {
            debug!(task_id = %task.id, tool = %tool, "served from working set");
            let result = ToolInvocationResult::ok(tool.as_str(), redact_secrets(&content), 0);
            return record_from(step, args, result, true);
        }

        let tool_ctx = ToolContext {
            working_directory: ctx.working_directory.clone(),
            cancel: Some(ctx.cancel.clone()),
        };
        let mut result = self.registry.call_tool(&tool, args.clone(), &tool_ctx).await;
        state.working_set.observe(
            &tool,
            &args,
            &ctx.working_directory,
            result.success,
            &result.content,
            step,
        );
        result.content = redact_secrets(&result.content);
        debug!(
            task_id = %task.id,
            tool = %tool,
            success = result.success,
            duration_ms = result.duration_ms,
            "tool call finished"
        );
        record_from(step, args, result, false)
    }

    /// Run a nested loop for another role, bounded by the parent's
    /// `deadline`. Returns the result plus the tokens the sub-agent spent.
    async fn delegate(
        &self,
        parent: &Task,
        ctx: &ExecutionContext,
        deadline: Instant,
        args: &Value,
    ) -> (ToolInvocationResult, u64, u64) {
        let key = qualify(LOCAL_SERVER_ID, DELEGATE_TOOL_NAME);
        if ctx.depth >= self.config.max_delegation_depth {
            let message = format!(
                "delegation depth limit ({}) reached; do the work yourself or finish",
                self.config.max_delegation_depth
            );
            return (ToolInvocationResult::failed(key, ToolFailure::DepthExceeded, message, 0), 0, 0);
        }

        let role = args.get("role").and_then(Value::as_str).map(str::trim).unwrap_or("");
        let description = args.get("task").and_then(Value::as_str).map(str::trim).unwrap_or("");
        if role.is_empty() || description.is_empty() {
            let message = format!("{DELEGATE_TOOL_NAME} needs non-empty 'role' and 'task' arguments");
            return (ToolInvocationResult::failed(key, ToolFailure::Execution, message, 0), 0, 0);
        }
        let share = args.get("share").and_then(Value::as_bool).unwrap_or(true);

        let mut child = Task::new(description, role).with_max_attempts(1);
        let child_ctx = ctx.child(child.id.clone(), &parent.description, share).with_deadline(deadline);
        info!(
            parent = %parent.id,
            child = %child.id,
            role,
            depth = child_ctx.depth,
            "delegating sub-task"
        );

        let started = Instant::now();
        match self.run_boxed(&mut child, &child_ctx).await {
            Ok(result) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let content = format!(
                    "[{role}] {} ({}): {}",
                    result.outcome.as_str(),
                    result.termination.label(),
                    result.summary
                );
                let invocation = if result.outcome == Outcome::Failed {
                    ToolInvocationResult::failed(key, ToolFailure::Execution, content, duration_ms)
                } else {
                    ToolInvocationResult::ok(key, content, duration_ms)
                };
                (invocation, result.tokens_in, result.tokens_out)
            }
            Err(e) => (
                ToolInvocationResult::failed(key, ToolFailure::Execution, e.to_string(), 0),
                0,
                0,
            ),
        }
    }

    async fn finish(
        &self,
        task: &mut Task,
        ctx: &ExecutionContext,
        mut state: RunState,
        termination: TerminationReason,
        started: Instant,
    ) -> RunResult {
        let succeeded = state.records.iter().any(|r| r.success);
        let (outcome, summary) = match &termination {
            TerminationReason::Completed => {
                let outcome = if succeeded { Outcome::Success } else { Outcome::Partial };
                let summary = std::mem::take(&mut state.summary);
                (outcome, summary)
            }
            TerminationReason::CorrectionsExhausted => (Outcome::Success, state.last_raw.trim().to_string()),
            TerminationReason::EngineFailed { message } => {
                self.events.emit(AgentEvent::Error {
                    task_id: task.id.clone(),
                    message: message.clone(),
                });
                (Outcome::Failed, local_summary(&termination, &state.records))
            }
            TerminationReason::Cancelled => (Outcome::Partial, local_summary(&termination, &state.records)),
            reason => {
                let summary = self.final_summary(task, &mut state, reason, ctx).await;
                (Outcome::Partial, summary)
            }
        };

        task.status = match outcome {
            Outcome::Failed if task.can_retry() => TaskStatus::Retrying,
            Outcome::Failed => TaskStatus::Failed,
            _ => TaskStatus::Completed,
        };

        if let (Some(plan), Some(board)) = (&ctx.plan_id, &ctx.blackboard) {
            board.write(plan, SUMMARY_KEY, &summary, &task.assigned_role, &task.id);
        }

        let confidence = termination.confidence();
        let loop_detected = matches!(termination, TerminationReason::LoopDetected { .. });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            task_id = %task.id,
            outcome = ?outcome,
            termination = %termination.label(),
            steps = state.step,
            tool_calls = state.records.len(),
            elapsed_ms,
            "task finished"
        );
        self.events.emit(AgentEvent::Completed {
            task_id: task.id.clone(),
            confidence,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            tools_called: state.records.len(),
        });

        RunResult {
            task_id: task.id.clone(),
            outcome,
            confidence,
            termination,
            summary,
            steps: state.step,
            tool_calls: state.records,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            loop_detected,
            elapsed_ms,
        }
    }

    /// Ask the engine for a closing summary with tools forbidden. Falls back
    /// to a locally built summary when the call fails or still tries to act.
    async fn final_summary(
        &self,
        task: &Task,
        state: &mut RunState,
        reason: &TerminationReason,
        ctx: &ExecutionContext,
    ) -> String {
        let user = prompt::summary_user_prompt(task, &reason.label(), &state.history);
        let options = ThinkOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            cancel: Some(ctx.cancel.clone()),
            ..Default::default()
        };
        match self.provider.think(prompt::summary_system_prompt(), &user, &options).await {
            Ok(response) => {
                state.account(&response);
                match parse_decision(&response.content) {
                    Decision::Completion { summary } if !summary.trim().is_empty() => summary,
                    Decision::ToolCall { .. } | Decision::Completion { .. } => {
                        local_summary(reason, &state.records)
                    }
                    Decision::Unparseable { .. } if response.content.trim().is_empty() => {
                        local_summary(reason, &state.records)
                    }
                    Decision::Unparseable { .. } => response.content.trim().to_string(),
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "summary call failed");
                local_summary(reason, &state.records)
            }
        }
    }
}

fn record_from(step: u32, args: Value, result: ToolInvocationResult, cached: bool) -> ToolCallRecord {
    ToolCallRecord {
        step,
        tool_key: result.tool_key,
        args,
        success: result.success,
        content: result.content,
        duration_ms: result.duration_ms,
        failure: result.failure,
        cached,
    }
}

/// Summary built from the tool-result history alone.
pub fn local_summary(reason: &TerminationReason, records: &[ToolCallRecord]) -> String {
    let successes: Vec<&ToolCallRecord> = records.iter().filter(|r| r.success).collect();
    let mut out = format!(
        "Stopped early ({}). {} of {} tool calls succeeded.",
        reason.label(),
        successes.len(),
        records.len()
    );
    for record in successes {
        let first_line = record.content.lines().next().unwrap_or("").trim();
        out.push_str(&format!(
            "\n- step {}: {} -> {}",
            record.step,
            record.tool_key,
            prompt::truncate(first_line, 120)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(step: u32, success: bool, content: &str) -> ToolCallRecord {
        ToolCallRecord {
            step,
            tool_key: "local::echo".into(),
            args: json!({}),
            success,
            content: content.into(),
            duration_ms: 1,
            failure: None,
            cached: false,
        }
    }

    #[test]
    fn test_local_summary_lists_successes_only() {
        let records = vec![record(1, true, "first line\nsecond"), record(2, false, "boom")];
        let text = local_summary(&TerminationReason::StepCeilingReached, &records);
        assert!(text.contains("step limit reached"));
        assert!(text.contains("1 of 2"));
        assert!(text.contains("step 1: local::echo -> first line"));
        assert!(!text.contains("boom"));
    }

    #[test]
    fn test_delegation_key_detection() {
        assert!(is_delegation("delegate_task"));
        assert!(is_delegation("local::delegate_task"));
        assert!(!is_delegation("remote::delegate_task"));
        assert_eq!(delegate_definition().key, "local::delegate_task");
    }
}
