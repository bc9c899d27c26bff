//! Client transactions spanning one or more destinations.
//!
//! Messages added to a transaction are staged in each destination under the
//! transaction's internal id and only become visible on commit. The registry
//! tracks every open transaction broker-wide and sweeps the expired ones.

use crate::core::config::TransactionConfig;
use crate::core::time::{ScheduledTask, SharedClock, TaskScheduler};
use crate::messaging::destination::{Destination, DestinationError, DestinationKind, Message};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Transaction state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Open => "open",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction {id} already {state}")]
    AlreadyCompleted { id: String, state: &'static str },
    #[error("destination {0} is read-only")]
    ReadOnlyDestination(String),
    #[error(transparent)]
    Destination(#[from] DestinationError),
}

struct TransactionInner {
    state: TransactionState,
    destinations: Vec<Destination>,
}

/// One client transaction.
pub struct Transaction {
    protocol_id: String,
    internal_id: u64,
    expires_at: Instant,
    inner: Mutex<TransactionInner>,
}

impl Transaction {
    fn new(protocol_id: String, internal_id: u64, expires_at: Instant) -> Self {
        Self {
            protocol_id,
            internal_id,
            expires_at,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Open,
                destinations: Vec::new(),
            }),
        }
    }

    /// Id chosen by the client protocol.
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// Broker-wide unique id; the staging key in every destination.
    pub fn internal_id(&self) -> u64 {
        self.internal_id
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn destinations(&self) -> Vec<String> {
        self.inner
            .lock()
            .destinations
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    fn completed(&self, state: TransactionState) -> TransactionError {
        TransactionError::AlreadyCompleted {
            id: self.protocol_id.clone(),
            state: state.as_str(),
        }
    }

    /// Stage `message` on `destination`. Schema destinations are not
    /// transactional and store the message straight away.
    pub fn add(&self, destination: &Destination, message: Message) -> Result<(), TransactionError> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(self.completed(inner.state));
        }
        match destination.kind() {
            DestinationKind::Metrics => Err(TransactionError::ReadOnlyDestination(
                destination.name().to_string(),
            )),
            DestinationKind::Schema { .. } => {
                drop(inner);
                destination.store().store_message(message)?;
                Ok(())
            }
            DestinationKind::Topic | DestinationKind::Queue | DestinationKind::Temporary { .. } => {
                destination
                    .store()
                    .store_transactional(self.internal_id, message)?;
                if !inner.destinations.iter().any(|d| d.same_as(destination)) {
                    inner.destinations.push(destination.clone());
                }
                Ok(())
            }
        }
    }

    pub fn commit(&self) -> Result<(), TransactionError> {
        let destinations = self.finish(TransactionState::Committed)?;
        let mut first_err = None;
        for destination in &destinations {
            if let Err(err) = destination.store().commit(self.internal_id) {
                warn!(txn = self.internal_id, destination = %destination.name(), "commit failed: {err}");
                first_err.get_or_insert(err);
            }
        }
        info!(txn = self.internal_id, id = %self.protocol_id, destinations = destinations.len(), "transaction committed");
        first_err.map_or(Ok(()), |err| Err(err.into()))
    }

    pub fn abort(&self) -> Result<(), TransactionError> {
        let destinations = self.finish(TransactionState::Aborted)?;
        let mut first_err = None;
        for destination in &destinations {
            if let Err(err) = destination.store().abort(self.internal_id) {
                warn!(txn = self.internal_id, destination = %destination.name(), "abort failed: {err}");
                first_err.get_or_insert(err);
            }
        }
        info!(txn = self.internal_id, id = %self.protocol_id, "transaction aborted");
        first_err.map_or(Ok(()), |err| Err(err.into()))
    }

    /// Abort if still open. A no-op on a completed transaction.
    pub fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        match self.abort() {
            Ok(()) | Err(TransactionError::AlreadyCompleted { .. }) => {}
            Err(err) => warn!(txn = self.internal_id, "implicit abort failed: {err}"),
        }
    }

    fn finish(&self, target: TransactionState) -> Result<Vec<Destination>, TransactionError> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(self.completed(inner.state));
        }
        inner.state = target;
        Ok(std::mem::take(&mut inner.destinations))
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("protocol_id", &self.protocol_id)
            .field("internal_id", &self.internal_id)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All transactions in the process, keyed by internal id.
pub struct TransactionRegistry {
    clock: SharedClock,
    expiry: Duration,
    sweep_interval: Duration,
    next_id: AtomicU64,
    transactions: Mutex<HashMap<u64, Arc<Transaction>>>,
    sweeper: Mutex<Option<ScheduledTask>>,
}

impl TransactionRegistry {
    pub fn new(config: &TransactionConfig, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            expiry: config.expiry(),
            sweep_interval: config.sweep_interval(),
            next_id: AtomicU64::new(1),
            transactions: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
        })
    }

    /// Expiry horizon applied to every new transaction.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn begin(&self, protocol_id: &str) -> Arc<Transaction> {
        let internal_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let txn = Arc::new(Transaction::new(
            protocol_id.to_string(),
            internal_id,
            self.clock.now() + self.expiry,
        ));
        self.transactions.lock().insert(internal_id, txn.clone());
        debug!(txn = internal_id, id = %protocol_id, "transaction started");
        txn
    }

    pub fn find(&self, internal_id: u64) -> Option<Arc<Transaction>> {
        self.transactions.lock().get(&internal_id).cloned()
    }

    pub fn remove(&self, internal_id: u64) -> Option<Arc<Transaction>> {
        self.transactions.lock().remove(&internal_id)
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort expired transactions and drop completed ones. Returns how many
    /// were aborted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let (expired, completed): (Vec<_>, Vec<_>) = {
            let mut transactions = self.transactions.lock();
            let stale: Vec<Arc<Transaction>> = transactions
                .values()
                .filter(|txn| txn.state().is_terminal() || txn.is_expired(now))
                .cloned()
                .collect();
            for txn in &stale {
                transactions.remove(&txn.internal_id);
            }
            stale.into_iter().partition(|txn| !txn.state().is_terminal())
        };
        for txn in &expired {
            info!(txn = txn.internal_id, id = %txn.protocol_id, "transaction expired");
            txn.close();
        }
        if !expired.is_empty() || !completed.is_empty() {
            debug!(aborted = expired.len(), removed = completed.len(), "transaction sweep");
        }
        expired.len()
    }

    /// Start the periodic expiry sweep.
    pub fn start(self: &Arc<Self>, scheduler: &TaskScheduler) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let task = scheduler.schedule_at_fixed_rate(self.sweep_interval, move || {
            if let Some(registry) = registry.upgrade() {
                registry.sweep();
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(task) {
            previous.cancel();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::Clock;
    use crate::messaging::destination::{DestinationFactory, DestinationType, Qos};
    use crate::messaging::memory::MemoryDestinationFactory;

    struct TestClock {
        now: Mutex<Instant>,
    }

    impl TestClock {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, delta: Duration) {
            *self.now.lock() += delta;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }

        fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
            tokio::time::sleep(duration)
        }
    }

    fn msg() -> Message {
        Message::new("x".as_bytes(), Qos::AtLeastOnce, false)
    }

    fn registry(clock: Arc<TestClock>) -> Arc<TransactionRegistry> {
        let config = TransactionConfig {
            expiry_ms: 1_000,
            sweep_interval_ms: 100,
        };
        TransactionRegistry::new(&config, clock)
    }

    #[tokio::test]
    async fn commit_publishes_across_destinations() {
        let factory = MemoryDestinationFactory::new();
        let a = factory.find_or_create("a", DestinationType::Topic).await.unwrap();
        let b = factory.find_or_create("b", DestinationType::Queue).await.unwrap();
        let registry = registry(TestClock::new());
        let txn = registry.begin("tx-1");
        txn.add(&a, msg()).unwrap();
        txn.add(&b, msg()).unwrap();
        txn.add(&a, msg()).unwrap();
        assert!(factory.committed("a").is_empty());
        txn.commit().unwrap();
        assert_eq!(factory.committed("a").len(), 2);
        assert_eq!(factory.committed("b").len(), 1);

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, TransactionError::AlreadyCompleted { .. }));
        assert!(txn.abort().is_err());
        assert!(txn.add(&a, msg()).is_err());
        assert_eq!(factory.committed("a").len(), 2);
    }

    #[tokio::test]
    async fn abort_discards_and_close_is_idempotent() {
        let factory = MemoryDestinationFactory::new();
        let a = factory.find_or_create("a", DestinationType::Topic).await.unwrap();
        let registry = registry(TestClock::new());
        let txn = registry.begin("tx-2");
        txn.add(&a, msg()).unwrap();
        txn.abort().unwrap();
        txn.close();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(factory.committed("a").is_empty());
        assert_eq!(factory.store("a").unwrap().staged(txn.internal_id()), 0);
    }

    #[tokio::test]
    async fn schema_is_direct_and_metrics_is_read_only() {
        let factory = MemoryDestinationFactory::new();
        let schema = factory.find_or_create("$schema/a", DestinationType::Schema).await.unwrap();
        let metrics = factory.find_or_create("$SYS/m", DestinationType::Metrics).await.unwrap();
        let registry = registry(TestClock::new());
        let txn = registry.begin("tx-3");
        txn.add(&schema, msg()).unwrap();
        assert_eq!(factory.committed("$schema/a").len(), 1);
        assert!(matches!(
            txn.add(&metrics, msg()),
            Err(TransactionError::ReadOnlyDestination(_))
        ));
        txn.abort().unwrap();
        assert_eq!(factory.committed("$schema/a").len(), 1);
    }

    #[tokio::test]
    async fn sweep_aborts_expired_transactions() {
        let factory = MemoryDestinationFactory::new();
        let a = factory.find_or_create("a", DestinationType::Topic).await.unwrap();
        let clock = TestClock::new();
        let registry = registry(clock.clone());
        let old = registry.begin("old");
        old.add(&a, msg()).unwrap();
        clock.advance(Duration::from_millis(600));
        let young = registry.begin("young");
        assert_ne!(old.internal_id(), young.internal_id());
        clock.advance(Duration::from_millis(500));

        assert_eq!(registry.sweep(), 1);
        assert_eq!(old.state(), TransactionState::Aborted);
        assert_eq!(young.state(), TransactionState::Open);
        assert!(registry.find(old.internal_id()).is_none());
        assert_eq!(registry.len(), 1);

        young.commit().unwrap();
        assert_eq!(registry.sweep(), 0);
        assert!(registry.is_empty());
        assert!(factory.committed("a").is_empty());
    }
}
