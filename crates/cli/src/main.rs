use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod demo;

use commands::{SnapshotAction, StateAction};
use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "pipeflow")]
#[command(about = "DAG task orchestration engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pipeflow.toml", env = "PIPEFLOW_CONFIG")]
    config: PathBuf,

    /// Data directory for persisted state
    #[arg(short, long, default_value = "./data", env = "PIPEFLOW_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect persisted state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Manage state snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
    /// Run the built-in order pricing pipeline
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeflow=info,pipeflow_core=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("Data directory: {}", args.data_dir.display());

    let config = CliConfig::load(&args.config, args.data_dir)?;

    match args.command {
        Command::State { action } => {
            let manager = config.state_manager()?;
            commands::run_state(&manager, action).await
        }
        Command::Snapshot { action } => {
            let manager = config.state_manager()?;
            commands::run_snapshot(&manager, action).await
        }
        Command::Demo => demo::run(&config).await,
    }
}
