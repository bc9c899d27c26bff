//! Start command - runs the engine until interrupted.

use crate::cli::args::StartArgs;
use crate::core::config::EngineConfig;
use crate::core::time::TaskScheduler;
use crate::messaging::memory::MemoryDestinationFactory;
use crate::net::security::AnonymousSecurityManager;
use crate::ops::telemetry;
use crate::session::SessionManager;
use crate::storage::Storage;
use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;

pub async fn run_start(args: StartArgs) -> Result<()> {
    env::set_var("SESSION_ENGINE_CONFIG", args.config.display().to_string());

    let config = EngineConfig::load_from_env()?;
    config.validate()?;
    let _log_handle = telemetry::init_tracing(config.telemetry.log_level.as_deref())?;

    let storage = Storage::open(&config.storage).context("unable to open session storage")?;
    let scheduler = TaskScheduler::current()?;
    let manager = SessionManager::new(
        &config,
        Arc::new(AnonymousSecurityManager),
        MemoryDestinationFactory::new(),
        storage,
        scheduler,
    );
    manager.start().await;
    let status = manager.status()?;
    tracing::info!(
        pipelines = status.pipelines,
        hibernated = status.disconnected,
        wills = status.pending_wills,
        "engine running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    manager.stop();
    Ok(())
}
