use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bounded, tool-using task runner.
///
/// Runs one task through the orchestration loop with local tools and any
/// configured external tool servers, or exposes the local tools as a
/// tool server on stdio.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Bounded, tool-using task runner")]
pub struct CliArgs {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file (default: ~/.config/relay/config.toml)
    #[arg(long, global = true, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a task to completion and print the result
    Run(RunArgs),

    /// Inspect configured external tool servers
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },

    /// Serve the local tools over stdio
    Serve {
        /// Directory relative tool paths resolve against
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// What the agent should do
    pub task: String,

    /// Role whose permission profile applies
    #[arg(long, default_value = "executor")]
    pub role: String,

    /// Plan id; enables the shared blackboard for delegated sub-tasks
    #[arg(long)]
    pub plan: Option<String>,

    /// Directory relative tool paths resolve against
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Override the step ceiling for this run
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// Skip connecting to external tool servers
    #[arg(long)]
    pub no_mcp: bool,

    /// Print the run result as JSON instead of progress output
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum ServersAction {
    /// List configured servers without connecting
    List,
    /// Connect to every enabled server and report its state
    Check,
}
