use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub llm: LlmConfig,
    pub run: LoopConfig,
    pub blackboard: BlackboardConfig,
    pub budget: BudgetConfig,
    pub mcp: McpConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `RELAY_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("RELAY_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            llm: LlmConfig::from_env_profiled(p),
            run: LoopConfig::from_env_profiled(p),
            blackboard: BlackboardConfig::from_env_profiled(p),
            budget: BudgetConfig::from_env_profiled(p),
            mcp: McpConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<(), crate::RelayError> {
        if self.run.max_steps == 0 {
            return Err(crate::RelayError::Config("RELAY_MAX_STEPS must be at least 1".into()));
        }
        if self.run.max_loop_repeats < 2 {
            return Err(crate::RelayError::Config(
                "RELAY_MAX_LOOP_REPEATS must be at least 2".into(),
            ));
        }
        if !(self.budget.compact_threshold > 0.0 && self.budget.compact_threshold <= 1.0) {
            return Err(crate::RelayError::Config(format!(
                "BUDGET_COMPACT_THRESHOLD must be in (0, 1], got {}",
                self.budget.compact_threshold
            )));
        }
        if self.blackboard.max_entries_per_plan == 0 {
            return Err(crate::RelayError::Config(
                "BLACKBOARD_MAX_ENTRIES must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  llm:        provider={}, configured={}",
            self.llm.provider,
            self.llm.is_configured()
        );
        tracing::info!(
            "  loop:       max_steps={}, timeout_ms={}, max_depth={}",
            self.run.max_steps,
            self.run.timeout_ms,
            self.run.max_delegation_depth
        );
        tracing::info!(
            "  blackboard: ttl_secs={}, max_entries={}",
            self.blackboard.ttl_secs,
            self.blackboard.max_entries_per_plan
        );
        tracing::info!(
            "  mcp:        servers_file={}, max_reconnects={}",
            self.mcp.servers_file.display(),
            self.mcp.max_reconnect_attempts
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: String::new(),
            llm: LlmConfig::default(),
            run: LoopConfig::default(),
            blackboard: BlackboardConfig::default(),
            budget: BudgetConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

// ── LLM (OpenAI / Anthropic / Ollama) ────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "openai", "anthropic", "ollama"
    pub provider: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub request_timeout_secs: u64,
}

impl LlmConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            provider: profiled_env_or(p, "LLM_PROVIDER", &d.provider),
            openai_api_key: profiled_env_opt(p, "OPENAI_API_KEY"),
            openai_model: profiled_env_or(p, "OPENAI_MODEL", &d.openai_model),
            openai_base_url: profiled_env_opt(p, "OPENAI_BASE_URL"),
            anthropic_api_key: profiled_env_opt(p, "ANTHROPIC_API_KEY"),
            anthropic_model: profiled_env_or(p, "ANTHROPIC_MODEL", &d.anthropic_model),
            ollama_url: profiled_env_or(p, "OLLAMA_URL", &d.ollama_url),
            ollama_model: profiled_env_or(p, "OLLAMA_MODEL", &d.ollama_model),
            request_timeout_secs: profiled_env_parse(
                p,
                "LLM_REQUEST_TIMEOUT_SECS",
                d.request_timeout_secs,
            ),
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.provider.as_str() {
            "openai" => self.openai_api_key.is_some(),
            "anthropic" | "claude" => self.anthropic_api_key.is_some(),
            "ollama" => true,
            _ => false,
        }
    }

    /// Model name of the active provider.
    pub fn active_model(&self) -> &str {
        match self.provider.as_str() {
            "openai" => &self.openai_model,
            "anthropic" | "claude" => &self.anthropic_model,
            _ => &self.ollama_model,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            openai_api_key: None,
            openai_model: "gpt-4o".to_string(),
            openai_base_url: None,
            anthropic_api_key: None,
            anthropic_model: "claude-sonnet-4-5-20250929".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.2".to_string(),
            request_timeout_secs: 120,
        }
    }
}

// ── Orchestration loop limits ────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Absolute step ceiling per task.
    pub max_steps: u32,
    /// Wall-clock budget per task, measured from task start.
    pub timeout_ms: u64,
    /// Identical tool+arguments repeats that force a hard stop.
    pub max_loop_repeats: u32,
    /// Calls to one tool name (any arguments) before the warn-then-stop trigger.
    pub max_calls_per_tool: u32,
    /// Consecutive calls to one tool name before the warn-then-stop trigger.
    pub max_consecutive_same_tool: u32,
    /// Corrective re-prompts for unparseable responses.
    pub max_corrections: u32,
    pub max_delegation_depth: u32,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LoopConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_steps: profiled_env_parse(p, "RELAY_MAX_STEPS", d.max_steps),
            timeout_ms: profiled_env_parse(p, "RELAY_TIMEOUT_MS", d.timeout_ms),
            max_loop_repeats: profiled_env_parse(p, "RELAY_MAX_LOOP_REPEATS", d.max_loop_repeats),
            max_calls_per_tool: profiled_env_parse(
                p,
                "RELAY_MAX_CALLS_PER_TOOL",
                d.max_calls_per_tool,
            ),
            max_consecutive_same_tool: profiled_env_parse(
                p,
                "RELAY_MAX_CONSECUTIVE_SAME_TOOL",
                d.max_consecutive_same_tool,
            ),
            max_corrections: profiled_env_parse(p, "RELAY_MAX_CORRECTIONS", d.max_corrections),
            max_delegation_depth: profiled_env_parse(
                p,
                "RELAY_MAX_DELEGATION_DEPTH",
                d.max_delegation_depth,
            ),
            temperature: profiled_env_parse(p, "LLM_TEMPERATURE", d.temperature),
            max_tokens: profiled_env_parse(p, "LLM_MAX_TOKENS", d.max_tokens),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            timeout_ms: 600_000,
            max_loop_repeats: 3,
            max_calls_per_tool: 12,
            max_consecutive_same_tool: 6,
            max_corrections: 2,
            max_delegation_depth: 2,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

// ── Blackboard ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlackboardConfig {
    pub ttl_secs: u64,
    pub max_entries_per_plan: usize,
}

impl BlackboardConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            ttl_secs: profiled_env_parse(p, "BLACKBOARD_TTL_SECS", d.ttl_secs),
            max_entries_per_plan: profiled_env_parse(
                p,
                "BLACKBOARD_MAX_ENTRIES",
                d.max_entries_per_plan,
            ),
        }
    }
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries_per_plan: 200,
        }
    }
}

// ── Context budget ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Usage ratio of the input budget at which compaction kicks in.
    pub compact_threshold: f64,
    /// Context window assumed for models missing from the built-in table.
    pub default_context_window: usize,
    /// Tokens reserved for the model's reply.
    pub reserved_output_tokens: usize,
}

impl BudgetConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            compact_threshold: profiled_env_parse(
                p,
                "BUDGET_COMPACT_THRESHOLD",
                d.compact_threshold,
            ),
            default_context_window: profiled_env_parse(
                p,
                "BUDGET_DEFAULT_CONTEXT_WINDOW",
                d.default_context_window,
            ),
            reserved_output_tokens: profiled_env_parse(
                p,
                "BUDGET_RESERVED_OUTPUT_TOKENS",
                d.reserved_output_tokens,
            ),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 0.75,
            default_context_window: 32_000,
            reserved_output_tokens: 4096,
        }
    }
}

// ── External tool servers ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// JSON file holding the persisted server records.
    pub servers_file: PathBuf,
    pub reconnect_base_ms: u64,
    pub max_reconnect_attempts: u32,
    pub request_timeout_secs: u64,
}

impl McpConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            servers_file: profiled_env_opt(p, "RELAY_SERVERS_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.servers_file),
            reconnect_base_ms: profiled_env_parse(p, "MCP_RECONNECT_BASE_MS", d.reconnect_base_ms),
            max_reconnect_attempts: profiled_env_parse(
                p,
                "MCP_MAX_RECONNECT_ATTEMPTS",
                d.max_reconnect_attempts,
            ),
            request_timeout_secs: profiled_env_parse(
                p,
                "MCP_REQUEST_TIMEOUT_SECS",
                d.request_timeout_secs,
            ),
        }
    }
}

impl Default for McpConfig {
    fn default() -> Self {
        let servers_file = dirs::config_dir()
            .map(|d| d.join("relay").join("servers.json"))
            .unwrap_or_else(|| PathBuf::from("servers.json"));
        Self {
            servers_file,
            reconnect_base_ms: 1000,
            max_reconnect_attempts: 5,
            request_timeout_secs: 30,
        }
    }
}
