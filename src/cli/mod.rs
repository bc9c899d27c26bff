//! session-engine CLI.
//!
//! - `session-engine start` - Run the engine until interrupted
//! - `session-engine config check` - Validate a configuration file
//! - `session-engine inspect sessions|wills` - Dump persisted state

mod args;
pub mod commands;

pub use args::{
    Cli, Commands, ConfigAction, ConfigArgs, ConfigCheckArgs, InspectAction, InspectArgs,
    OutputFormat, StartArgs, StateInspectArgs,
};
