//! Read-through cache of file contents seen during a run.
//!
//! Only complete `file_read` results are stored, keyed by normalized path.
//! Later reads of the same path, whole or by line range, are answered from
//! the stored copy without invoking the tool. Writes through the local file
//! tools drop whatever they may have made stale.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use relay_tool_runtime::tools::file_read::line_range;
use relay_tool_runtime::{bare_name, is_external, normalize_key, redact_secrets};

use crate::budget::estimate_tokens;

const READ_TOOL: &str = "file_read";
const BINARY_PREFIX: &str = "Binary file, ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingSetEntry {
    pub normalized_path: String,
    /// Numbered output of a full read.
    pub content: String,
    pub step_recorded: u32,
    pub binary: bool,
}

impl WorkingSetEntry {
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }

    /// Lines `[offset, offset + limit)` of the stored read, 1-based.
    fn slice(&self, offset: usize, limit: Option<usize>) -> String {
        if self.binary {
            return self.content.clone();
        }
        if offset <= 1 && limit.is_none() {
            return self.content.clone();
        }
        if self.content.is_empty() {
            return String::new();
        }
        let lines: Vec<&str> = self.content.split('\n').collect();
        let start = (offset.max(1) - 1).min(lines.len());
        let end = match limit {
            Some(l) => (start + l).min(lines.len()),
            None => lines.len(),
        };
        lines[start..end].join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    entries: BTreeMap<String, WorkingSetEntry>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, normalized_path: &str) -> Option<&WorkingSetEntry> {
        self.entries.get(normalized_path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &WorkingSetEntry> {
        self.entries.values()
    }

    pub fn insert(&mut self, entry: WorkingSetEntry) {
        self.entries.insert(entry.normalized_path.clone(), entry);
    }

    pub fn remove(&mut self, normalized_path: &str) -> Option<WorkingSetEntry> {
        self.entries.remove(normalized_path)
    }

    /// Forget every cached file.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn total_tokens(&self) -> usize {
        self.entries.values().map(WorkingSetEntry::tokens).sum()
    }

    /// Answer a read from the cache when possible.
    pub fn lookup(&self, tool_key: &str, args: &Value, base: &Path) -> Option<String> {
        let path = read_path(tool_key, args)?;
        let entry = self.entries.get(&normalize_key(base, path))?;
        let (offset, limit) = line_range(args);
        Some(entry.slice(offset, limit))
    }

    /// Update the cache after a tool call ran.
    pub fn observe(&mut self, tool_key: &str, args: &Value, base: &Path, success: bool, content: &str, step: u32) {
        if is_external(tool_key) {
            return;
        }
        match bare_name(tool_key) {
            READ_TOOL => {
                let Some(path) = read_path(tool_key, args) else { return };
                let (offset, limit) = line_range(args);
                if success && offset == 1 && limit.is_none() {
                    self.insert(WorkingSetEntry {
                        normalized_path: normalize_key(base, path),
                        content: content.to_string(),
                        step_recorded: step,
                        binary: content.starts_with(BINARY_PREFIX),
                    });
                }
            }
            "file_write" | "file_delete" => {
                if let Some(path) = args.get("path").and_then(Value::as_str) {
                    self.entries.remove(&normalize_key(base, path));
                }
            }
            "file_move" => {
                for field in ["from", "to"] {
                    if let Some(path) = args.get(field).and_then(Value::as_str) {
                        self.entries.remove(&normalize_key(base, path));
                    }
                }
            }
            // A shell command may have touched anything.
            "shell_execute" => self.clear(),
            _ => {}
        }
    }

    /// Cached files rendered for the prompt with secrets redacted, each
    /// capped at `max_chars_per_file`.
    pub fn format_for_prompt(&self, max_chars_per_file: usize) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Files already read (re-reading is served from memory)\n");
        for entry in self.entries.values() {
            let content = redact_secrets(&entry.content);
            let mut body: String = content.chars().take(max_chars_per_file).collect();
            if content.chars().count() > max_chars_per_file {
                body.push_str("\n ...");
            }
            out.push_str(&format!(
                "### {} (read at step {})\n```\n{}\n```\n",
                entry.normalized_path, entry.step_recorded, body
            ));
        }
        out
    }
}

/// The path a local `file_read` call targets. Paths with `..` are left to the
/// tool so the safety gate sees them.
fn read_path<'a>(tool_key: &str, args: &'a Value) -> Option<&'a str> {
    if is_external(tool_key) || bare_name(tool_key) != READ_TOOL {
        return None;
    }
    let path = args.get("path").and_then(Value::as_str)?;
    if path.split(['/', '\\']).any(|part| part == "..") {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_tool_runtime::tools::file_read::number_lines;
    use serde_json::json;

    fn full_read(lines: &[&str]) -> String {
        number_lines(lines, 0)
    }

    fn base() -> &'static Path {
        Path::new("/work")
    }

    #[test]
    fn test_full_read_is_cached_under_normalized_path() {
        let mut ws = WorkingSet::new();
        let content = full_read(&["a", "b", "c"]);
        ws.observe("local::file_read", &json!({"path": "./src/lib.rs"}), base(), true, &content, 1);

        assert_eq!(
            ws.lookup("file_read", &json!({"path": "src/lib.rs"}), base()),
            Some(content)
        );
        assert!(ws.get("/work/src/lib.rs").is_some());
    }

    #[test]
    fn test_sub_range_matches_tool_output() {
        let mut ws = WorkingSet::new();
        let lines = ["a", "b", "c", "d", "e"];
        ws.observe("file_read", &json!({"path": "f.txt"}), base(), true, &full_read(&lines), 1);

        let cached = ws
            .lookup("file_read", &json!({"path": "f.txt", "offset": 2, "limit": 2}), base())
            .unwrap();
        assert_eq!(cached, number_lines(&lines[1..3], 1));
    }

    #[test]
    fn test_partial_and_failed_reads_are_not_cached() {
        let mut ws = WorkingSet::new();
        ws.observe("file_read", &json!({"path": "f", "offset": 3}), base(), true, "x", 1);
        ws.observe("file_read", &json!({"path": "g"}), base(), false, "missing", 1);
        assert!(ws.is_empty());
    }

    #[test]
    fn test_writes_invalidate() {
        let mut ws = WorkingSet::new();
        for p in ["a", "b", "c"] {
            ws.observe("file_read", &json!({"path": p}), base(), true, "     1\tx", 1);
        }
        ws.observe("file_write", &json!({"path": "a", "content": "y"}), base(), true, "ok", 2);
        assert!(ws.get("/work/a").is_none());

        ws.observe("file_move", &json!({"from": "b", "to": "z"}), base(), true, "ok", 3);
        assert!(ws.get("/work/b").is_none());
        assert_eq!(ws.len(), 1);

        ws.observe("local::shell_execute", &json!({"command": "ls"}), base(), true, "", 4);
        assert!(ws.is_empty());
    }

    #[test]
    fn test_prompt_rendering_caps_each_file() {
        let mut ws = WorkingSet::new();
        assert_eq!(ws.format_for_prompt(100), "");
        ws.observe("file_read", &json!({"path": "big.txt"}), base(), true, &"z".repeat(500), 1);
        let text = ws.format_for_prompt(100);
        assert!(text.contains("### /work/big.txt (read at step 1)"));
        assert!(!text.contains(&"z".repeat(101)));
    }

    #[test]
    fn test_prompt_rendering_redacts_secrets() {
        let mut ws = WorkingSet::new();
        let content = full_read(&["API_KEY=abcdef123456", "debug=true"]);
        ws.observe("file_read", &json!({"path": ".env.example"}), base(), true, &content, 1);

        let text = ws.format_for_prompt(1_000);
        assert!(!text.contains("abcdef123456"));
        assert!(text.contains("[REDACTED]"));
        assert!(text.contains("debug=true"));
        // The cache itself keeps the exact bytes a re-read would return.
        assert_eq!(ws.get("/work/.env.example").unwrap().content, content);
    }

    #[test]
    fn test_traversal_and_remote_reads_bypass_cache() {
        let mut ws = WorkingSet::new();
        ws.observe("file_read", &json!({"path": "/etc/hosts"}), Path::new("/"), true, "     1\tx", 1);
        assert!(ws
            .lookup("file_read", &json!({"path": "../../etc/hosts"}), Path::new("/work/p"))
            .is_none());
        assert!(ws
            .lookup("fs::file_read", &json!({"path": "/etc/hosts"}), Path::new("/"))
            .is_none());
    }
}
