use anyhow::Result;
use crossterm::{
    queue,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};

use relay_agent::{AgentEvent, EventSink, Outcome, RunResult};
use relay_mcp::{ConnectionStatus, ServerSummary};

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const THINKING: Color = Color::DarkGrey;
    const TOOL_CALL: Color = Color::Yellow;
    const TOOL_RESULT: Color = Color::DarkGreen;
    const ERROR: Color = Color::Red;
    const SUCCESS: Color = Color::Green;
    const DIM: Color = Color::DarkGrey;
    const HEADER: Color = Color::Magenta;
}

const RESULT_PREVIEW_CHARS: usize = 160;

/// Prints progress events as they arrive.
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, event: AgentEvent) {
        let mut stdout = io::stdout();
        if render_event(&mut stdout, &event).is_ok() {
            stdout.flush().ok();
        }
    }
}

fn render_event(out: &mut impl Write, event: &AgentEvent) -> io::Result<()> {
    match event {
        AgentEvent::Thinking { step, .. } => queue!(
            out,
            SetForegroundColor(Colors::THINKING),
            Print(format!("[step {step}] thinking...\n")),
            ResetColor,
        ),
        AgentEvent::Acting { step, action, .. } => queue!(
            out,
            SetForegroundColor(Colors::TOOL_CALL),
            Print(format!("[step {step}] {action}\n")),
            ResetColor,
        ),
        AgentEvent::ToolResult { tool, success, summary, .. } => {
            let (color, label) = if *success {
                (Colors::TOOL_RESULT, "ok")
            } else {
                (Colors::ERROR, "failed")
            };
            queue!(
                out,
                SetForegroundColor(color),
                Print(format!("  [{tool} {label}]: {}\n", preview(summary))),
                ResetColor,
            )
        }
        AgentEvent::Completed {
            confidence,
            tokens_in,
            tokens_out,
            tools_called,
            ..
        } => queue!(
            out,
            SetForegroundColor(Colors::DIM),
            Print(format!(
                "done: confidence {confidence:?}, {tools_called} tool calls, \
                 {tokens_in} tokens in / {tokens_out} out\n"
            )),
            ResetColor,
        ),
        AgentEvent::Error { message, .. } => queue!(
            out,
            SetForegroundColor(Colors::ERROR),
            Print(format!("[error: {message}]\n")),
            ResetColor,
        ),
    }
}

fn preview(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    if first_line.chars().count() > RESULT_PREVIEW_CHARS || text.lines().nth(1).is_some() {
        let kept: String = first_line.chars().take(RESULT_PREVIEW_CHARS).collect();
        format!("{kept}... ({} chars total)", text.chars().count())
    } else {
        first_line.to_string()
    }
}

/// Print the final result of a run.
pub fn print_result(result: &RunResult) -> Result<()> {
    let mut stdout = io::stdout();
    render_result(&mut stdout, result)?;
    stdout.flush()?;
    Ok(())
}

fn render_result(out: &mut impl Write, result: &RunResult) -> io::Result<()> {
    let color = match result.outcome {
        Outcome::Success => Colors::SUCCESS,
        Outcome::Partial => Colors::TOOL_CALL,
        Outcome::Failed => Colors::ERROR,
    };
    queue!(
        out,
        Print("\n"),
        SetForegroundColor(color),
        Print(format!(
            "{} ({}) after {} steps\n",
            result.outcome.as_str(),
            result.termination.label(),
            result.steps
        )),
        ResetColor,
        Print(format!("{}\n", result.summary)),
    )
}

/// Print the server table.
pub fn print_servers(servers: &[ServerSummary]) -> Result<()> {
    let mut stdout = io::stdout();
    render_servers(&mut stdout, servers)?;
    stdout.flush()?;
    Ok(())
}

fn render_servers(out: &mut impl Write, servers: &[ServerSummary]) -> io::Result<()> {
    if servers.is_empty() {
        return queue!(
            out,
            SetForegroundColor(Colors::DIM),
            Print("No tool servers configured.\n"),
            ResetColor,
        );
    }

    queue!(
        out,
        SetForegroundColor(Colors::HEADER),
        Print(format!(
            "{:<16} {:<24} {:<8} {:<13} {:<6} {}\n",
            "ID", "NAME", "KIND", "STATUS", "TOOLS", "LAST ERROR"
        )),
        SetForegroundColor(Colors::DIM),
        Print(format!("{}\n", "-".repeat(80))),
        ResetColor,
    )?;

    for s in servers {
        let status = if s.enabled { s.state.status.to_string() } else { "disabled".to_string() };
        let color = match s.state.status {
            _ if !s.enabled => Colors::DIM,
            ConnectionStatus::Connected => Colors::SUCCESS,
            ConnectionStatus::Error => Colors::ERROR,
            _ => Colors::TOOL_CALL,
        };
        queue!(
            out,
            Print(format!("{:<16} {:<24} {:<8} ", s.id, s.name, s.transport)),
            SetForegroundColor(color),
            Print(format!("{status:<13} ")),
            ResetColor,
            Print(format!(
                "{:<6} {}\n",
                s.state.tool_count,
                s.state.last_error.as_deref().unwrap_or("")
            )),
        )?;
    }
    Ok(())
}

/// Print an error message.
pub fn print_error(msg: &str) -> Result<()> {
    let mut stderr = io::stderr();
    crossterm::execute!(
        stderr,
        SetForegroundColor(Colors::ERROR),
        Print(format!("Error: {msg}\n")),
        ResetColor,
    )?;
    Ok(())
}
