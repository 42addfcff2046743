mod cli;
mod commands;
mod config;
mod console;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use relay_agent::Outcome;
use relay_core::config::{load_dotenv, Config};

use crate::cli::{CliArgs, Command};
use crate::config::CliConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Logs go to stderr; stdout carries results and, for `serve`, the protocol.
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "relay failed");
            console::print_error(&format!("{e:#}")).ok();
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(args: CliArgs) -> Result<ExitCode> {
    load_dotenv();
    let config = Config::from_env();
    config.validate().context("invalid environment configuration")?;
    config.log_summary();

    let cli_config = CliConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;

    match args.command {
        Command::Run(run) => {
            let result = commands::run(run, &config, &cli_config).await?;
            Ok(match result.outcome {
                Outcome::Failed => ExitCode::FAILURE,
                Outcome::Success | Outcome::Partial => ExitCode::SUCCESS,
            })
        }
        Command::Servers { action } => {
            commands::servers(action, &config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { working_dir } => {
            commands::serve(working_dir, &cli_config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
