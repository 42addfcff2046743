//! Prompt assembly for the orchestration loop.

use relay_tool_runtime::{ToolDefinition, DELEGATE_TOOL_NAME};

use crate::types::{ExecutionContext, Task, ToolCallRecord};

const SCHEMA_CHARS: usize = 600;
const PRIOR_RESULT_CHARS: usize = 2_000;

/// Per-iteration state that goes into the user prompt.
#[derive(Debug, Default)]
pub struct Turn<'a> {
    pub step: u32,
    pub max_steps: u32,
    pub blackboard: &'a str,
    pub working_set: &'a str,
    pub history: &'a [String],
    pub warning: Option<&'a str>,
    pub correction: Option<&'a str>,
}

pub fn system_prompt(role: &str, tools: &[ToolDefinition]) -> String {
    let mut out = format!(
        "You are the {role} agent. You work through a task one step at a time, \
         using tools to inspect and change the environment.\n\n"
    );

    out.push_str("## Available tools\n");
    if tools.is_empty() {
        out.push_str("(none: answer from what you already know)\n");
    }
    for tool in tools {
        let schema = truncate(&tool.input_schema.to_string(), SCHEMA_CHARS);
        out.push_str(&format!("- `{}`: {}\n  input: {}\n", tool.key, tool.description, schema));
    }

    out.push_str(
        "\n## Response format\n\
         Reply with exactly one JSON object and nothing else. Either call a tool:\n\
         {\"tool\": \"<server>::<name>\", \"args\": { ... }}\n\
         or finish the task:\n\
         {\"done\": true, \"summary\": \"<what you did and found>\"}\n\n\
         Rules:\n\
         - One tool call per reply. You will see its result before your next step.\n\
         - Never put a tool call inside a completion.\n\
         - Do not repeat a call whose result you already have.\n",
    );
    if tools.iter().any(|t| t.name() == DELEGATE_TOOL_NAME) {
        out.push_str(&format!(
            "- Use `{DELEGATE_TOOL_NAME}` with {{\"role\": ..., \"task\": ...}} to hand a \
             self-contained sub-task to another agent.\n"
        ));
    }
    out
}

pub fn user_prompt(task: &Task, ctx: &ExecutionContext, turn: &Turn<'_>) -> String {
    let mut out = format!("## Task\n{}\n", task.description);

    if let Some(parent) = &ctx.parent_task {
        out.push_str(&format!("\n## Delegated from\n{parent}\n"));
    }
    if !ctx.prior_results.is_empty() {
        out.push_str("\n## Results of earlier tasks\n");
        for result in &ctx.prior_results {
            out.push_str(&format!("- {}\n", truncate(result, PRIOR_RESULT_CHARS)));
        }
    }
    if !ctx.history.is_empty() {
        out.push_str("\n## Conversation so far\n");
        for line in &ctx.history {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !turn.blackboard.is_empty() {
        out.push('\n');
        out.push_str(turn.blackboard);
    }
    if !turn.working_set.is_empty() {
        out.push('\n');
        out.push_str(turn.working_set);
    }

    out.push_str(&format!("\n## Progress (step {} of {})\n", turn.step, turn.max_steps));
    if turn.history.is_empty() {
        out.push_str("No steps taken yet.\n");
    }
    for entry in turn.history {
        out.push_str(entry);
        out.push('\n');
    }

    if let Some(warning) = turn.warning {
        out.push_str(&format!("\nWARNING: {warning}\n"));
    }
    if let Some(correction) = turn.correction {
        out.push_str(&format!(
            "\nYour previous reply could not be used ({correction}). \
             Reply with exactly one JSON object in the required format.\n"
        ));
    }
    out
}

/// One line in the progress section for an executed call.
pub fn step_entry(record: &ToolCallRecord, preview_chars: usize) -> String {
    let status = if record.success { "ok" } else { "failed" };
    let cached = if record.cached { ", from memory" } else { "" };
    format!(
        "Step {}: {} {} -> {}{}:\n{}",
        record.step,
        record.tool_key,
        record.args,
        status,
        cached,
        truncate(&record.content, preview_chars)
    )
}

pub fn summary_system_prompt() -> &'static str {
    "You are wrapping up a task that had to stop early. Tools are no longer \
     available. Reply in plain text only: summarize what was done, what was \
     found, and what remains open."
}

pub fn summary_user_prompt(task: &Task, reason: &str, history: &[String]) -> String {
    let mut out = format!("## Task\n{}\n\n## Stopped because\n{reason}\n\n## Steps taken\n", task.description);
    if history.is_empty() {
        out.push_str("None.\n");
    }
    for entry in history {
        out.push_str(entry);
        out.push('\n');
    }
    out.push_str("\nWrite the summary now. Do not call any tool.\n");
    out
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept} ...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_prompt_lists_tools_and_contract() {
        let tools = vec![
            ToolDefinition::new("local::file_read", "Read a file", json!({"type": "object"})),
            ToolDefinition::new("local::delegate_task", "Delegate", json!({"type": "object"})),
        ];
        let prompt = system_prompt("executor", &tools);
        assert!(prompt.contains("executor"));
        assert!(prompt.contains("`local::file_read`"));
        assert!(prompt.contains("\"done\": true"));
        assert!(prompt.contains("One tool call per reply"));
        assert!(prompt.contains("delegate_task"));
    }

    #[test]
    fn test_user_prompt_sections() {
        let task = Task::new("count the lines", "researcher");
        let ctx = ExecutionContext::new(task.id.clone()).with_prior_results(vec!["earlier: 3 files".into()]);
        let history = vec!["Step 1: local::list_directory {} -> ok:\na\nb".to_string()];
        let turn = Turn {
            step: 2,
            max_steps: 10,
            history: &history,
            warning: Some("slow down"),
            correction: Some("no JSON object found in the reply"),
            ..Default::default()
        };
        let prompt = user_prompt(&task, &ctx, &turn);
        assert!(prompt.starts_with("## Task\ncount the lines"));
        assert!(prompt.contains("earlier: 3 files"));
        assert!(prompt.contains("step 2 of 10"));
        assert!(prompt.contains("WARNING: slow down"));
        assert!(prompt.contains("could not be used"));
        assert!(!prompt.contains("Delegated from"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo", 10), "héllo");
        assert_eq!(truncate("héllo", 2), "hé ...");
    }
}
