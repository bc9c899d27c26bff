//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Building engine configurations
//! - Wiring a session manager to in-memory destinations and storage
//! - Recording deliveries handed to a protocol adapter

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use session_engine::config::{EngineConfig, TenantEntry, TenantScope};
use session_engine::destination::Qos;
use session_engine::messaging::MemoryDestinationFactory;
use session_engine::net::security::{AnonymousSecurityManager, SecurityManager};
use session_engine::session::{Delivery, MessageListener, SessionContext, WillRequest};
use session_engine::storage::Storage;
use session_engine::subscriptions::Completion;
use session_engine::time::TaskScheduler;
use session_engine::SessionManager;
use session_engine::connection::LocalConnection;
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration with a short transaction expiry and grace period.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sessions.pipelines = 4;
    config.sessions.keep_alive_grace_ms = 500;
    config.transactions.expiry_ms = 1_000;
    config.transactions.sweep_interval_ms = 100;
    config
}

pub fn tenant(name: &str, root: &str, scope: TenantScope) -> TenantEntry {
    TenantEntry {
        name: name.to_string(),
        namespace_root: root.to_string(),
        scope,
    }
}

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub destinations: Arc<MemoryDestinationFactory>,
    pub storage: Storage,
}

impl Harness {
    /// Must be called from within a tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(config, Arc::new(AnonymousSecurityManager), Storage::in_memory())
    }

    pub fn with_parts(
        config: EngineConfig,
        security: Arc<dyn SecurityManager>,
        storage: Storage,
    ) -> Self {
        let destinations = MemoryDestinationFactory::new();
        let scheduler = TaskScheduler::current().expect("tokio runtime");
        let manager = SessionManager::new(
            &config,
            security,
            destinations.clone(),
            storage.clone(),
            scheduler,
        );
        Self {
            manager,
            destinations,
            storage,
        }
    }

    pub fn committed(&self, destination: &str) -> usize {
        self.destinations.committed(destination).len()
    }
}

pub fn connection(name: &str) -> Arc<LocalConnection> {
    Arc::new(LocalConnection::new(name, "mqtt"))
}

pub fn context(session_id: &str) -> session_engine::session::SessionContextBuilder {
    SessionContext::builder(session_id, connection(session_id))
}

pub fn will(destination: &str, delay_secs: u64) -> WillRequest {
    WillRequest {
        destination: destination.to_string(),
        payload: Bytes::from_static(b"offline"),
        qos: Qos::AtLeastOnce,
        retain: false,
        delay_secs,
    }
}

/// Let spawned publishes (wills, restores) run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Listener that records every delivery and completes it straight away.
#[derive(Default)]
pub struct Recorder {
    deliveries: Mutex<Vec<Delivery>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn destinations(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .iter()
            .map(|d| d.destination.clone())
            .collect()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.deliveries
            .lock()
            .iter()
            .map(|d| d.message.payload.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }
}

impl MessageListener for Recorder {
    fn on_message(&self, delivery: Delivery, completion: Completion) {
        self.deliveries.lock().push(delivery);
        completion.complete();
    }
}
