//! Context Budget Manager.
//!
//! Estimates how much of a model's context window a prompt uses and, when
//! usage crosses the configured threshold, shrinks the step history and the
//! working set in stages until enough tokens are freed:
//!
//! 1. [`CompactionLevel::TrimHistory`]: shorten older step summaries
//! 2. [`CompactionLevel::EvictStaleFiles`]: drop cached files not read recently
//! 3. [`CompactionLevel::DropHistory`]: keep only the most recent steps and
//!    the files read in the current step
//!
//! Compaction never mutates its inputs and is idempotent: compacting an
//! already compacted state with the same target frees nothing further.

use serde::Serialize;

use relay_core::config::BudgetConfig;

use crate::working_set::WorkingSet;

/// Steps kept verbatim by every level.
const KEEP_RECENT_STEPS: usize = 3;
/// Characters an older step summary keeps after trimming.
const TRIM_CHARS: usize = 240;
const TRIM_MARKER: &str = " ...[trimmed]";
const DROPPED_MARKER: &str = "[earlier steps omitted to save context]";
/// A cached file older than this many steps counts as stale.
const STALE_AFTER_STEPS: u32 = 3;

/// Context windows by model-name prefix; the longest matching prefix wins.
const MODEL_WINDOWS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4.1", 1_000_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
    ("claude", 200_000),
    ("llama3.1", 128_000),
    ("llama3.2", 128_000),
    ("llama3", 8_192),
    ("qwen2.5", 32_768),
    ("mistral", 32_768),
    ("deepseek", 64_000),
];

/// Rough token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub context_window: usize,
    /// Window minus the tokens reserved for the reply.
    pub input_budget: usize,
    pub used: usize,
    pub usage_ratio: f64,
    pub should_compact: bool,
    /// Tokens to free to get back under the threshold.
    pub excess: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionLevel {
    None,
    TrimHistory,
    EvictStaleFiles,
    DropHistory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compaction {
    pub reduced_working_set: WorkingSet,
    pub reduced_history: Vec<String>,
    pub tokens_freed: usize,
    pub level_applied: CompactionLevel,
}

#[derive(Debug, Clone)]
pub struct ContextBudget {
    config: BudgetConfig,
}

impl ContextBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    pub fn context_window(&self, model: &str) -> usize {
        let model = model.to_ascii_lowercase();
        let model = model.rsplit('/').next().unwrap_or(&model);
        MODEL_WINDOWS
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, window)| *window)
            .unwrap_or(self.config.default_context_window)
    }

    pub fn budget_for(&self, model: &str, used: usize) -> BudgetStatus {
        let context_window = self.context_window(model);
        let input_budget = context_window
            .saturating_sub(self.config.reserved_output_tokens)
            .max(1);
        let usage_ratio = used as f64 / input_budget as f64;
        let allowed = (input_budget as f64 * self.config.compact_threshold).floor() as usize;
        BudgetStatus {
            context_window,
            input_budget,
            used,
            usage_ratio,
            should_compact: usage_ratio >= self.config.compact_threshold,
            excess: used.saturating_sub(allowed),
        }
    }

    /// Free at least `target` tokens if the stages allow it, escalating only
    /// as far as needed. `target == 0` returns the inputs unchanged.
    pub fn compact(&self, working_set: &WorkingSet, history: &[String], target: usize, at_step: u32) -> Compaction {
        let before = footprint(working_set, history);
        let mut ws = working_set.clone();
        let mut hist = history.to_vec();
        let mut level = CompactionLevel::None;

        if target > 0 {
            let stages: [(CompactionLevel, fn(&mut WorkingSet, &mut Vec<String>, u32)); 3] = [
                (CompactionLevel::TrimHistory, trim_history),
                (CompactionLevel::EvictStaleFiles, evict_stale_files),
                (CompactionLevel::DropHistory, drop_history),
            ];
            for (stage, apply) in stages {
                let prior = footprint(&ws, &hist);
                apply(&mut ws, &mut hist, at_step);
                if footprint(&ws, &hist) < prior {
                    level = stage;
                }
                if before.saturating_sub(footprint(&ws, &hist)) >= target {
                    break;
                }
            }
        }

        let tokens_freed = before.saturating_sub(footprint(&ws, &hist));
        if tokens_freed == 0 {
            return Compaction {
                reduced_working_set: working_set.clone(),
                reduced_history: history.to_vec(),
                tokens_freed: 0,
                level_applied: CompactionLevel::None,
            };
        }
        Compaction {
            reduced_working_set: ws,
            reduced_history: hist,
            tokens_freed,
            level_applied: level,
        }
    }
}

fn footprint(ws: &WorkingSet, history: &[String]) -> usize {
    ws.total_tokens() + history.iter().map(|h| estimate_tokens(h)).sum::<usize>()
}

fn older_steps(len: usize) -> usize {
    len.saturating_sub(KEEP_RECENT_STEPS)
}

fn trim_history(_: &mut WorkingSet, history: &mut Vec<String>, _: u32) {
    let older = older_steps(history.len());
    let limit = TRIM_CHARS + TRIM_MARKER.chars().count();
    for item in history.iter_mut().take(older) {
        if item.chars().count() > limit {
            let kept: String = item.chars().take(TRIM_CHARS).collect();
            *item = format!("{kept}{TRIM_MARKER}");
        }
    }
}

fn evict_stale_files(ws: &mut WorkingSet, _: &mut Vec<String>, at_step: u32) {
    let stale: Vec<String> = ws
        .entries()
        .filter(|e| at_step.saturating_sub(e.step_recorded) >= STALE_AFTER_STEPS)
        .map(|e| e.normalized_path.clone())
        .collect();
    for path in stale {
        ws.remove(&path);
    }
}

fn drop_history(ws: &mut WorkingSet, history: &mut Vec<String>, at_step: u32) {
    let body: Vec<String> = history
        .iter()
        .filter(|h| h.as_str() != DROPPED_MARKER)
        .cloned()
        .collect();
    let had_marker = body.len() != history.len();
    if body.len() > KEEP_RECENT_STEPS || had_marker {
        let recent = body[older_steps(body.len())..].to_vec();
        *history = std::iter::once(DROPPED_MARKER.to_string()).chain(recent).collect();
    }

    let old: Vec<String> = ws
        .entries()
        .filter(|e| e.step_recorded < at_step)
        .map(|e| e.normalized_path.clone())
        .collect();
    for path in old {
        ws.remove(&path);
    }
}
