//! session-engine - CLI entrypoint.
//!
//! Usage:
//!   session-engine start --config config/session-engine.toml
//!   session-engine config check --config config/session-engine.toml
//!   session-engine inspect sessions --data-dir data
//!   session-engine inspect wills --data-dir data --format json

use anyhow::Result;
use clap::Parser;
use session_engine::cli::commands::{run_config, run_inspect, run_start};
use session_engine::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Config(args) => run_config(args),
        Commands::Inspect(args) => run_inspect(args),
    }
}
