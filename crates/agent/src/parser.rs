//! Decoder for engine replies.
//!
//! A reply is expected to carry exactly one JSON object, either
//! `{"tool": "<server>::<name>", "args": {...}}` or
//! `{"done": true, "summary": "..."}`. Engines wrap that object in prose or
//! markdown often enough that extraction is layered. Strategies run in this
//! order and the first candidate that parses as a JSON object wins:
//!
//! 1. the whole reply, trimmed
//! 2. the contents of each fenced code block
//! 3. a bracket-depth scan of the free text for balanced `{...}` spans

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall { tool: String, args: Value },
    Completion { summary: String },
    Unparseable { reason: String },
}

impl Decision {
    fn unparseable(reason: impl Into<String>) -> Self {
        Decision::Unparseable { reason: reason.into() }
    }
}

pub fn parse_decision(reply: &str) -> Decision {
    match extract_object(reply) {
        Some(object) => classify(object),
        None => Decision::unparseable("no JSON object found in the reply"),
    }
}

/// First JSON object found by the strategies above.
pub fn extract_object(reply: &str) -> Option<Map<String, Value>> {
    let trimmed = reply.trim();
    if let Some(obj) = parse_object(trimmed) {
        return Some(obj);
    }
    if let Some(obj) = fenced_blocks(trimmed).into_iter().find_map(parse_object) {
        return Some(obj);
    }
    balanced_spans(trimmed).into_iter().find_map(parse_object)
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn classify(object: Map<String, Value>) -> Decision {
    let done = object.get("done").and_then(Value::as_bool).unwrap_or(false);
    if done {
        if object.contains_key("tool") || object.values().any(wraps_tool_call) {
            return Decision::unparseable("a completion must not contain a tool call");
        }
        let summary = match object.get("summary") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        return Decision::Completion { summary };
    }

    let Some(tool) = object.get("tool") else {
        return Decision::unparseable("object has neither \"tool\" nor \"done\"");
    };
    let Some(tool) = tool.as_str().map(str::trim).filter(|t| !t.is_empty()) else {
        return Decision::unparseable("\"tool\" must be a non-empty string");
    };
    let args = match object.get("args") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(_) => return Decision::unparseable("\"args\" must be an object"),
    };
    Decision::ToolCall {
        tool: tool.to_string(),
        args,
    }
}

fn wraps_tool_call(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key("tool") || map.values().any(wraps_tool_call),
        Value::Array(items) => items.iter().any(wraps_tool_call),
        _ => false,
    }
}

/// Bodies of ``` fenced blocks, with any language tag line removed.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map_or(after.len(), |n| n + 1);
        let body = &after[body_start..];
        let Some(end) = body.find("```") else { break };
        blocks.push(body[..end].trim());
        rest = &body[end + 3..];
    }
    blocks
}

/// Every balanced `{...}` span, in order of its opening brace. Braces inside
/// JSON strings are ignored.
fn balanced_spans(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        if let Some(end) = matching_brace(bytes, start) {
            spans.push(&text[start..=end]);
        }
        from = start + 1;
    }
    spans
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_tool_call() {
        let d = parse_decision(r#"{"tool": "local::file_read", "args": {"path": "a.txt"}}"#);
        assert_eq!(
            d,
            Decision::ToolCall {
                tool: "local::file_read".into(),
                args: json!({"path": "a.txt"})
            }
        );
    }

    #[test]
    fn test_fenced_completion() {
        let reply = "All set.\n```json\n{\"done\": true, \"summary\": \"fixed it\"}\n```\n";
        assert_eq!(
            parse_decision(reply),
            Decision::Completion { summary: "fixed it".into() }
        );
    }

    #[test]
    fn test_balanced_scan_ignores_braces_in_strings() {
        let reply = r#"I'll look first: {"tool": "search", "args": {"q": "fn main() { }"}} then decide."#;
        match parse_decision(reply) {
            Decision::ToolCall { tool, args } => {
                assert_eq!(tool, "search");
                assert_eq!(args["q"], "fn main() { }");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_first_parseable_candidate_wins() {
        let reply = r#"broken {"tool": } and then {"done": true, "summary": "a"} and {"done": true, "summary": "b"}"#;
        assert_eq!(parse_decision(reply), Decision::Completion { summary: "a".into() });
    }

    #[test]
    fn test_completion_wrapping_tool_call_is_rejected() {
        let nested = r#"{"done": true, "summary": "x", "next": {"tool": "file_write", "args": {}}}"#;
        assert!(matches!(parse_decision(nested), Decision::Unparseable { .. }));

        let flat = r#"{"done": true, "tool": "file_write"}"#;
        assert!(matches!(parse_decision(flat), Decision::Unparseable { .. }));
    }

    #[test]
    fn test_missing_args_default_to_empty_object() {
        assert_eq!(
            parse_decision(r#"{"tool": "list_directory"}"#),
            Decision::ToolCall { tool: "list_directory".into(), args: json!({}) }
        );
    }

    #[test]
    fn test_rejects_non_object_args_and_prose() {
        assert!(matches!(
            parse_decision(r#"{"tool": "x", "args": [1, 2]}"#),
            Decision::Unparseable { .. }
        ));
        assert!(matches!(
            parse_decision("I think we are finished here."),
            Decision::Unparseable { .. }
        ));
        assert!(matches!(parse_decision(r#"{"answer": 42}"#), Decision::Unparseable { .. }));
    }
}
