//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// session-engine - session and subscription lifecycle engine.
#[derive(Parser)]
#[command(name = "session-engine")]
#[command(version)]
#[command(about = "Session lifecycle engine and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine with the in-process destination store until interrupted
    Start(StartArgs),

    /// Configuration tooling
    Config(ConfigArgs),

    /// Inspect persisted session and will state
    Inspect(InspectArgs),
}

/// Output format for inspection commands.
#[derive(clap::ValueEnum, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human readable table
    #[default]
    Text,
    /// JSON objects, one per line
    Json,
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, env = "SESSION_ENGINE_CONFIG", default_value = "config/session-engine.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Config command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Load and validate a configuration file
    Check(ConfigCheckArgs),
}

#[derive(Args)]
pub struct ConfigCheckArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/session-engine.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Inspect command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct InspectArgs {
    #[command(subcommand)]
    pub action: InspectAction,
}

#[derive(Subcommand)]
pub enum InspectAction {
    /// List persisted sessions and their subscriptions
    Sessions(StateInspectArgs),
    /// List pending wills
    Wills(StateInspectArgs),
}

#[derive(Args)]
pub struct StateInspectArgs {
    /// Data directory (the `storage.data_dir` of the engine)
    #[arg(long, env = "SESSION_ENGINE_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}
