//! Stuck-loop detection for one run.
//!
//! Three detectors share a single "already warned" flag:
//! an identical tool+arguments signature repeated `max_repeats` times stops
//! the run outright, while a tool called `max_calls_per_tool` times in total
//! or `max_consecutive` times in a row first produces a warning for the next
//! prompt and stops the run if any of them fires again.

use std::collections::HashMap;

use serde_json::Value;

use relay_core::config::LoopConfig;
use relay_tool_runtime::canonical_key;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Proceed,
    /// Run the call, then show this warning in the next prompt.
    Warn(String),
    /// Do not run the call; end the run.
    Stop(String),
}

pub struct LoopGuard {
    max_repeats: u32,
    max_calls_per_tool: u32,
    max_consecutive: u32,
    signatures: HashMap<String, u32>,
    per_tool: HashMap<String, u32>,
    last_tool: Option<String>,
    consecutive: u32,
    warned: bool,
}

impl LoopGuard {
    pub fn new(max_repeats: u32, max_calls_per_tool: u32, max_consecutive: u32) -> Self {
        Self {
            max_repeats: max_repeats.max(1),
            max_calls_per_tool: max_calls_per_tool.max(1),
            max_consecutive: max_consecutive.max(1),
            signatures: HashMap::new(),
            per_tool: HashMap::new(),
            last_tool: None,
            consecutive: 0,
            warned: false,
        }
    }

    pub fn from_config(config: &LoopConfig) -> Self {
        Self::new(
            config.max_loop_repeats,
            config.max_calls_per_tool,
            config.max_consecutive_same_tool,
        )
    }

    /// Record an intended call and decide whether it may run.
    ///
    /// `search` and `local::search` count as the same tool.
    pub fn check(&mut self, tool: &str, args: &Value) -> GuardVerdict {
        let tool = canonical_key(tool);
        let tool = tool.as_str();
        let signature = format!("{tool}|{args}");
        let repeats = self.signatures.entry(signature).or_insert(0);
        *repeats += 1;
        if *repeats >= self.max_repeats {
            return GuardVerdict::Stop(format!(
                "'{tool}' was called {} times with identical arguments",
                *repeats
            ));
        }

        let calls = self.per_tool.entry(tool.to_string()).or_insert(0);
        *calls += 1;
        let calls = *calls;

        if self.last_tool.as_deref() == Some(tool) {
            self.consecutive += 1;
        } else {
            self.last_tool = Some(tool.to_string());
            self.consecutive = 1;
        }

        let trigger = if calls >= self.max_calls_per_tool {
            Some(format!("'{tool}' has been called {calls} times in this task"))
        } else if self.consecutive >= self.max_consecutive {
            Some(format!("'{tool}' has been called {} times in a row", self.consecutive))
        } else {
            None
        };

        match trigger {
            None => GuardVerdict::Proceed,
            Some(detail) if self.warned => GuardVerdict::Stop(detail),
            Some(detail) => {
                self.warned = true;
                GuardVerdict::Warn(format!(
                    "{detail}. Try a different approach or finish with a summary of what you have."
                ))
            }
        }
    }

    pub fn warned(&self) -> bool {
        self.warned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_calls_stop_at_limit() {
        let mut guard = LoopGuard::new(3, 100, 100);
        let args = json!({"q": "x"});
        assert_eq!(guard.check("search", &args), GuardVerdict::Proceed);
        assert_eq!(guard.check("search", &args), GuardVerdict::Proceed);
        assert!(matches!(guard.check("search", &args), GuardVerdict::Stop(_)));
    }

    #[test]
    fn test_key_spellings_share_counters() {
        let mut guard = LoopGuard::new(3, 100, 2);
        let args = json!({"q": "x"});
        assert_eq!(guard.check("search", &args), GuardVerdict::Proceed);
        assert!(matches!(guard.check("local::search", &args), GuardVerdict::Warn(_)));
        assert!(matches!(guard.check("search", &args), GuardVerdict::Stop(_)));

        // External tools keep their own identity.
        let mut guard = LoopGuard::new(2, 100, 100);
        assert_eq!(guard.check("docs::search", &args), GuardVerdict::Proceed);
        assert_eq!(guard.check("search", &args), GuardVerdict::Proceed);
    }

    #[test]
    fn test_different_args_are_different_signatures() {
        let mut guard = LoopGuard::new(2, 100, 100);
        assert_eq!(guard.check("search", &json!({"q": "a"})), GuardVerdict::Proceed);
        assert_eq!(guard.check("search", &json!({"q": "b"})), GuardVerdict::Proceed);
    }

    #[test]
    fn test_consecutive_warns_then_stops() {
        let mut guard = LoopGuard::new(100, 100, 2);
        assert_eq!(guard.check("read", &json!({"p": 1})), GuardVerdict::Proceed);
        assert!(matches!(guard.check("read", &json!({"p": 2})), GuardVerdict::Warn(_)));
        assert!(guard.warned());
        assert!(matches!(guard.check("read", &json!({"p": 3})), GuardVerdict::Stop(_)));
    }

    #[test]
    fn test_other_tool_resets_consecutive_run() {
        let mut guard = LoopGuard::new(100, 100, 2);
        guard.check("read", &json!({"p": 1}));
        guard.check("list", &json!({}));
        assert_eq!(guard.check("read", &json!({"p": 2})), GuardVerdict::Proceed);
    }

    #[test]
    fn test_warning_is_shared_across_detectors() {
        let mut guard = LoopGuard::new(100, 2, 100);
        guard.check("a", &json!({"n": 1}));
        assert!(matches!(guard.check("a", &json!({"n": 2})), GuardVerdict::Warn(_)));

        // A different detector firing after the warning stops the run.
        let mut guard2 = LoopGuard::new(100, 2, 2);
        guard2.check("a", &json!({"n": 1}));
        assert!(matches!(guard2.check("a", &json!({"n": 2})), GuardVerdict::Warn(_)));
        guard2.check("b", &json!({"n": 1}));
        assert!(matches!(guard2.check("b", &json!({"n": 2})), GuardVerdict::Stop(_)));
    }
}
