//! Configuration validation.

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::core::config::{EngineConfig, TenantScope};
use anyhow::{Context, Result};

pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Check(check) => {
            let config = EngineConfig::load(&check.config)?;
            config
                .validate()
                .with_context(|| format!("invalid config {}", check.config.display()))?;
            println!("{}: ok", check.config.display());
            println!("  pipelines: {}", config.sessions.pipelines);
            println!("  default expiry: {}s", config.sessions.default_expiry_secs);
            println!("  transaction expiry: {}ms", config.transactions.expiry_ms);
            let users = config
                .tenants
                .entries
                .iter()
                .filter(|e| e.scope == TenantScope::User)
                .count();
            println!(
                "  tenants: {} user, {} global",
                users,
                config.tenants.entries.len() - users
            );
            match &config.storage.data_dir {
                Some(dir) => println!("  storage: {}", dir.display()),
                None => println!("  storage: in-memory"),
            }
            Ok(())
        }
    }
}
