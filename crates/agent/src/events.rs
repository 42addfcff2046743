//! Progress events emitted while a task runs.
//!
//! Emission is fire-and-forget: a sink that is slow, full or gone never
//! affects the loop.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::Confidence;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    Thinking {
        task_id: String,
        step: u32,
    },
    Acting {
        task_id: String,
        step: u32,
        action: String,
    },
    ToolResult {
        task_id: String,
        tool: String,
        success: bool,
        summary: String,
        step: u32,
    },
    Completed {
        task_id: String,
        confidence: Confidence,
        tokens_in: u64,
        tokens_out: u64,
        tools_called: usize,
    },
    Error {
        task_id: String,
        message: String,
    },
}

impl AgentEvent {
    pub fn task_id(&self) -> &str {
        match self {
            AgentEvent::Thinking { task_id, .. }
            | AgentEvent::Acting { task_id, .. }
            | AgentEvent::ToolResult { task_id, .. }
            | AgentEvent::Completed { task_id, .. }
            | AgentEvent::Error { task_id, .. } => task_id,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AgentEvent);
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: AgentEvent) {}
}

/// Forwards events to an unbounded channel; a dropped receiver is ignored.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AgentEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: AgentEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Writes events to the tracing subscriber at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: AgentEvent) {
        match &event {
            AgentEvent::Error { task_id, message } => {
                tracing::warn!(task_id = %task_id, message = %message, "task error");
            }
            other => tracing::debug!(event = ?other, "agent event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(AgentEvent::Thinking { task_id: "t".into(), step: 1 });
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(AgentEvent::ToolResult {
            task_id: "t".into(),
            tool: "local::echo".into(),
            success: true,
            summary: "ok".into(),
            step: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "tool-result");
        assert_eq!(json["step"], 2);
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(AgentEvent::Thinking { task_id: "a".into(), step: 1 });
        sink.emit(AgentEvent::Error { task_id: "a".into(), message: "x".into() });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].task_id(), "a");
    }
}
