//! Task orchestration for relay.
//!
//! An [`Orchestrator`] drives one task through a bounded think, decide, act
//! loop against an [`LlmProvider`](relay_llm::LlmProvider), calling tools
//! through a [`ToolRegistry`](relay_tool_runtime::ToolRegistry) after the
//! role's permission profile allows them.
//!
//! # Modules
//!
//! - **types**: tasks, execution context, run results
//! - **parser**: reply decoder (`ToolCall | Completion | Unparseable`)
//! - **loop_guard**: repeated-call and stuck-tool detection
//! - **working_set**: read-through cache of files read during a run
//! - **budget**: token estimates and staged compaction
//! - **blackboard**: per-plan shared findings with TTL sweep
//! - **events**: fire-and-forget progress events
//! - **prompt**: prompt assembly
//! - **orchestrator**: the loop itself, including delegation

pub mod blackboard;
pub mod budget;
pub mod events;
pub mod loop_guard;
pub mod orchestrator;
pub mod parser;
pub mod prompt;
pub mod types;
pub mod working_set;

pub use blackboard::{Blackboard, BlackboardEntry, WriteOutcome};
pub use budget::{estimate_tokens, BudgetStatus, Compaction, CompactionLevel, ContextBudget};
pub use events::{AgentEvent, ChannelSink, EventSink, MemorySink, NullSink, TracingSink};
pub use loop_guard::{GuardVerdict, LoopGuard};
pub use orchestrator::{delegate_definition, local_summary, Orchestrator, SUMMARY_KEY};
pub use parser::{parse_decision, Decision};
pub use types::*;
pub use working_set::{WorkingSet, WorkingSetEntry};
