//! Shared scratchpad for the tasks of one plan.
//!
//! Entries are scoped to a plan id; nothing is visible across plans. Each
//! `(key, writer_role, task_id)` has at most one entry per plan, and a plan
//! holds at most `max_entries` entries. Once full, new entries are dropped
//! with a warning while existing ones can still be overwritten.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relay_core::config::BlackboardConfig;
use relay_tool_runtime::redact_secrets;

const PROMPT_VALUE_CHARS: usize = 1_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlackboardEntry {
    pub key: String,
    pub value: String,
    pub writer_role: String,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Overwritten,
    /// The plan is at capacity.
    Dropped,
}

struct PlanBoard {
    first_write: DateTime<Utc>,
    entries: Vec<BlackboardEntry>,
}

pub struct Blackboard {
    ttl: Duration,
    max_entries: usize,
    plans: Mutex<HashMap<String, PlanBoard>>,
}

impl Blackboard {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BlackboardConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_entries_per_plan)
    }

    fn plans(&self) -> MutexGuard<'_, HashMap<String, PlanBoard>> {
        self.plans.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(
        &self,
        plan_id: &str,
        key: &str,
        value: &str,
        writer_role: &str,
        task_id: &str,
    ) -> WriteOutcome {
        self.write_at(plan_id, key, value, writer_role, task_id, Utc::now())
    }

    /// `write` with an explicit timestamp.
    pub fn write_at(
        &self,
        plan_id: &str,
        key: &str,
        value: &str,
        writer_role: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> WriteOutcome {
        let value = redact_secrets(value);
        let mut plans = self.plans();
        let board = plans.entry(plan_id.to_string()).or_insert_with(|| PlanBoard {
            first_write: now,
            entries: Vec::new(),
        });

        if let Some(existing) = board
            .entries
            .iter_mut()
            .find(|e| e.key == key && e.writer_role == writer_role && e.task_id == task_id)
        {
            existing.value = value;
            existing.timestamp = now;
            return WriteOutcome::Overwritten;
        }

        if board.entries.len() >= self.max_entries {
            warn!(
                plan_id,
                key,
                max_entries = self.max_entries,
                "blackboard full, dropping write"
            );
            return WriteOutcome::Dropped;
        }

        board.entries.push(BlackboardEntry {
            key: key.to_string(),
            value,
            writer_role: writer_role.to_string(),
            task_id: task_id.to_string(),
            timestamp: now,
        });
        debug!(plan_id, key, writer_role, "blackboard write");
        WriteOutcome::Inserted
    }

    /// Every writer's entry for `key`, oldest first.
    pub fn read(&self, plan_id: &str, key: &str) -> Vec<BlackboardEntry> {
        self.filtered(plan_id, |e| e.key == key)
    }

    /// Most recent entry for `key` from any writer.
    pub fn read_latest(&self, plan_id: &str, key: &str) -> Option<BlackboardEntry> {
        self.read(plan_id, key).into_iter().max_by_key(|e| e.timestamp)
    }

    pub fn read_by_role(&self, plan_id: &str, role: &str) -> Vec<BlackboardEntry> {
        self.filtered(plan_id, |e| e.writer_role == role)
    }

    pub fn read_all(&self, plan_id: &str) -> Vec<BlackboardEntry> {
        self.filtered(plan_id, |_| true)
    }

    fn filtered(&self, plan_id: &str, keep: impl Fn(&BlackboardEntry) -> bool) -> Vec<BlackboardEntry> {
        self.plans()
            .get(plan_id)
            .map(|b| b.entries.iter().filter(|e| keep(e)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, plan_id: &str) -> usize {
        self.plans().get(plan_id).map_or(0, |b| b.entries.len())
    }

    /// Render a plan's entries for a prompt, leaving out what the caller
    /// itself wrote for this same task. Empty when there is nothing to show.
    pub fn format_for_prompt(&self, plan_id: &str, exclude_role: &str, exclude_task_id: &str) -> String {
        let entries = self.filtered(plan_id, |e| {
            !(e.writer_role == exclude_role && e.task_id == exclude_task_id)
        });
        if entries.is_empty() {
            return String::new();
        }

        let mut out = String::from("## Shared findings from other agents\n");
        for entry in entries {
            let value: String = entry.value.chars().take(PROMPT_VALUE_CHARS).collect();
            let ellipsis = if entry.value.chars().count() > PROMPT_VALUE_CHARS { " ..." } else { "" };
            out.push_str(&format!(
                "- [{} / {}] {}: {}{}\n",
                entry.writer_role, entry.task_id, entry.key, value, ellipsis
            ));
        }
        out
    }

    pub fn clear(&self, plan_id: &str) {
        self.plans().remove(plan_id);
    }

    /// Evict plans whose first write is at least `ttl` old. Returns how many.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let mut plans = self.plans();
        let before = plans.len();
        plans.retain(|_, board| now.signed_duration_since(board.first_write) < ttl);
        let evicted = before - plans.len();
        if evicted > 0 {
            debug!(evicted, "blackboard sweep");
        }
        evicted
    }

    pub fn plan_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plans().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop all plans.
    pub fn reset(&self) {
        self.plans().clear();
    }
}
