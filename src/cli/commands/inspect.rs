//! Persisted state inspection.

use crate::cli::args::{InspectAction, InspectArgs, OutputFormat, StateInspectArgs};
use crate::core::config::StorageConfig;
use crate::storage::Storage;
use anyhow::{anyhow, Context, Result};

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    match args.action {
        InspectAction::Sessions(state) => inspect_sessions(&state),
        InspectAction::Wills(state) => inspect_wills(&state),
    }
}

fn open(args: &StateInspectArgs) -> Result<Storage> {
    if !args.data_dir.is_dir() {
        return Err(anyhow!("{} is not a directory", args.data_dir.display()));
    }
    let config = StorageConfig {
        data_dir: Some(args.data_dir.clone()),
    };
    Storage::open(&config).with_context(|| format!("unable to open {}", args.data_dir.display()))
}

fn inspect_sessions(args: &StateInspectArgs) -> Result<()> {
    let storage = open(args)?;
    let sessions = storage.sessions.load_all()?;
    if sessions.is_empty() && args.format == OutputFormat::Text {
        println!("no persisted sessions under {}", args.data_dir.display());
        return Ok(());
    }
    for details in sessions {
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&details)?),
            OutputFormat::Text => {
                println!(
                    "{} (internal={}, unique={}, expiry={}s)",
                    details.session_id, details.internal_id, details.unique_id, details.expiry_secs
                );
                for sub in &details.subscriptions {
                    println!(
                        "  {} -> {} [{} qos={} credit={:?}]",
                        sub.alias,
                        sub.destination_name,
                        sub.destination_type.as_str(),
                        sub.qos.as_u8(),
                        sub.credit_mode
                    );
                }
            }
        }
    }
    Ok(())
}

fn inspect_wills(args: &StateInspectArgs) -> Result<()> {
    let storage = open(args)?;
    let wills = storage.wills.load_all()?;
    if wills.is_empty() && args.format == OutputFormat::Text {
        println!("no pending wills under {}", args.data_dir.display());
        return Ok(());
    }
    for will in wills {
        match args.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&will)?),
            OutputFormat::Text => println!(
                "{} -> {} ({} bytes, qos={}, retain={}, delay={}s)",
                will.session_id,
                will.destination,
                will.payload.len(),
                will.qos.as_u8(),
                will.retain,
                will.delay_secs
            ),
        }
    }
    Ok(())
}
