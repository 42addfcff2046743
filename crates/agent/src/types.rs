use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_tool_runtime::ToolFailure;

use crate::blackboard::Blackboard;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

/// A unit of work for one role. Mutated only by the loop driving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub description: String,
    pub assigned_role: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub status: TaskStatus,
}

fn default_max_attempts() -> u32 {
    2
}

impl Task {
    pub fn new(description: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            assigned_role: role.into(),
            dependencies: Vec::new(),
            attempts: 0,
            max_attempts: default_max_attempts(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Everything a loop needs besides the task itself.
///
/// Only `depth` changes, and only when a child context is derived.
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    pub plan_id: Option<String>,
    /// Description of the task that delegated this one.
    pub parent_task: Option<String>,
    /// Results of sibling tasks that finished before this one.
    pub prior_results: Vec<String>,
    /// Earlier conversation turns supplied by the caller.
    pub history: Vec<String>,
    pub cancel: CancellationToken,
    pub depth: u32,
    pub blackboard: Option<Arc<Blackboard>>,
    pub working_directory: PathBuf,
    /// Wall-clock instant after which the run stops; a run's own timeout
    /// can shorten it but never extend it.
    pub deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            plan_id: None,
            parent_task: None,
            prior_results: Vec::new(),
            history: Vec::new(),
            cancel: CancellationToken::new(),
            depth: 0,
            blackboard: None,
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            deadline: None,
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self::new(task.id.clone())
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>, blackboard: Arc<Blackboard>) -> Self {
        self.plan_id = Some(plan_id.into());
        self.blackboard = Some(blackboard);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_prior_results(mut self, results: Vec<String>) -> Self {
        self.prior_results = results;
        self
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.history = history;
        self
    }

    /// Context for a delegated sub-task: one level deeper, same plan and
    /// deadline, and a cancel token that fires when the parent's does.
    pub fn child(&self, task_id: impl Into<String>, parent_task: &str, share_blackboard: bool) -> Self {
        Self {
            task_id: task_id.into(),
            plan_id: self.plan_id.clone(),
            parent_task: Some(parent_task.to_string()),
            prior_results: Vec::new(),
            history: Vec::new(),
            cancel: self.cancel.child_token(),
            depth: self.depth + 1,
            blackboard: if share_blackboard { self.blackboard.clone() } else { None },
            working_directory: self.working_directory.clone(),
            deadline: self.deadline,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Why a run stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The engine signalled completion.
    Completed,
    /// Unparseable output after every corrective re-prompt.
    CorrectionsExhausted,
    LoopDetected { detail: String },
    StepCeilingReached,
    TimedOut,
    Cancelled,
    EngineFailed { message: String },
}

impl TerminationReason {
    pub fn confidence(&self) -> Confidence {
        match self {
            TerminationReason::Completed => Confidence::High,
            TerminationReason::CorrectionsExhausted | TerminationReason::LoopDetected { .. } => {
                Confidence::Medium
            }
            _ => Confidence::Low,
        }
    }

    /// Early stops that still get a best-effort final summary.
    pub fn needs_summary(&self) -> bool {
        matches!(
            self,
            TerminationReason::LoopDetected { .. }
                | TerminationReason::StepCeilingReached
                | TerminationReason::TimedOut
                | TerminationReason::Cancelled
        )
    }

    pub fn label(&self) -> String {
        match self {
            TerminationReason::Completed => "completed".into(),
            TerminationReason::CorrectionsExhausted => "unparseable output".into(),
            TerminationReason::LoopDetected { detail } => format!("loop detected: {detail}"),
            TerminationReason::StepCeilingReached => "step limit reached".into(),
            TerminationReason::TimedOut => "timed out".into(),
            TerminationReason::Cancelled => "cancelled".into(),
            TerminationReason::EngineFailed { message } => format!("engine failed: {message}"),
        }
    }
}

/// One executed (or refused) tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub step: u32,
    pub tool_key: String,
    pub args: Value,
    pub success: bool,
    /// Tool output with secrets redacted.
    pub content: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
    /// Served from the working set instead of invoking the tool.
    #[serde(default)]
    pub cached: bool,
}

/// Final result of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub task_id: String,
    pub outcome: Outcome,
    pub confidence: Confidence,
    pub termination: TerminationReason,
    pub summary: String,
    pub steps: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub loop_detected: bool,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn successful_calls(&self) -> usize {
        self.tool_calls.iter().filter(|c| c.success).count()
    }

    /// Tool invocations that actually reached a tool (cache hits excluded).
    pub fn invocations(&self) -> usize {
        self.tool_calls.iter().filter(|c| !c.cached).count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("task {task_id} has used all {attempts} attempts")]
    AttemptsExhausted { task_id: String, attempts: u32 },
}
