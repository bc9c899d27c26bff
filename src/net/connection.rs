use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Transport handle a protocol adapter passes in with the session context.
pub trait ClientConnection: Send + Sync {
    /// Remote endpoint or listener-assigned name.
    fn name(&self) -> &str;
    fn protocol(&self) -> &str;
    fn version(&self) -> &str {
        ""
    }
    /// Negotiated keep-alive; zero disables the idle check.
    fn keep_alive(&self) -> Duration;
    fn last_activity(&self) -> Instant;
    /// Called when no traffic was seen for longer than keep-alive plus grace.
    fn keep_alive_expired(&self, idle: Duration);
}

/// In-process connection used by embedded callers and tests.
#[derive(Debug)]
pub struct LocalConnection {
    name: String,
    protocol: String,
    keep_alive: Duration,
    last_activity: Mutex<Instant>,
    expired: AtomicBool,
}

impl LocalConnection {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            keep_alive: Duration::ZERO,
            last_activity: Mutex::new(tokio::time::Instant::now().into_std()),
            expired: AtomicBool::new(false),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Record traffic.
    pub fn touch(&self) {
        *self.last_activity.lock() = tokio::time::Instant::now().into_std();
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }
}

impl ClientConnection for LocalConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    fn keep_alive_expired(&self, idle: Duration) {
        if !self.expired.swap(true, Ordering::AcqRel) {
            info!(connection = %self.name, idle_ms = idle.as_millis() as u64, "keep-alive expired");
        }
    }
}
