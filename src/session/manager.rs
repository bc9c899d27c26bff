//! Session lifecycle orchestration.
//!
//! Session identities are sharded across a fixed array of pipelines. Each
//! pipeline owns one mutex guarding its live-session map and its map of
//! retained subscription controllers; every create/close/expire transition
//! for an identity runs under that identity's pipeline lock.
//!
//! The pipeline of an identity is `xxhash64(identity, seed 0) % pipelines`.
//! The pipeline count is fixed for the process lifetime: changing it while
//! controllers are hibernated would strand them in the wrong pipeline.

use super::{Session, SessionContext, SessionError, SessionInfo, SessionServices};
use crate::core::config::EngineConfig;
use crate::core::config::SessionConfig;
use crate::core::time::TaskScheduler;
use crate::messaging::destination::{DestinationFactory, DestinationType, Message};
use crate::messaging::namespace::TenantManagement;
use crate::messaging::subscriptions::SubscriptionController;
use crate::messaging::transactions::TransactionRegistry;
use crate::messaging::will::{WillTask, WillTaskRegistry};
use crate::net::security::SecurityManager;
use crate::storage::{SessionDetailStore, SessionDetails, Storage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

#[derive(Default)]
struct PipelineState {
    sessions: HashMap<String, Arc<Session>>,
    /// Persistent controllers, plus any controller parked while hibernating.
    controllers: HashMap<String, Arc<SubscriptionController>>,
}

pub(super) struct Pipeline {
    index: usize,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    /// Run `f` while holding this pipeline's lock.
    pub(super) fn serialize<R>(&self, f: impl FnOnce() -> R) -> R {
        let _state = self.state.lock();
        f()
    }
}

#[derive(Debug, Default)]
struct Counters {
    connected: AtomicU64,
    disconnected: AtomicU64,
    expired: AtomicU64,
}

impl Counters {
    fn decrement(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

/// Teardown work finished after the pipeline lock is released.
#[must_use]
struct Teardown {
    session_id: String,
    will: Option<Arc<WillTask>>,
}

impl Teardown {
    fn finish(self, wills: &WillTaskRegistry) {
        if let Some(will) = self.will {
            will.cancel();
            will.run();
            wills.forget(&self.session_id);
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ManagerStatus {
    pub pipelines: usize,
    pub connected: u64,
    pub disconnected: u64,
    pub expired: u64,
    pub pending_wills: usize,
    pub open_transactions: usize,
}

pub struct SessionManager {
    config: SessionConfig,
    security: Arc<dyn SecurityManager>,
    services: Arc<SessionServices>,
    pipelines: Vec<Arc<Pipeline>>,
    next_internal_id: AtomicU64,
    counters: Counters,
    self_ref: Weak<SessionManager>,
}

/// Deterministic pipeline index for an identity.
pub fn pipeline_index(session_id: &str, pipelines: usize) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(session_id.as_bytes());
    (hasher.finish() % pipelines.max(1) as u64) as usize
}

impl SessionManager {
    pub fn new(
        config: &EngineConfig,
        security: Arc<dyn SecurityManager>,
        destinations: Arc<dyn DestinationFactory>,
        storage: Storage,
        scheduler: TaskScheduler,
    ) -> Arc<Self> {
        let transactions = TransactionRegistry::new(&config.transactions, scheduler.clock().clone());
        let wills = WillTaskRegistry::new(destinations.clone(), storage.wills.clone(), scheduler.clone());
        let services = Arc::new(SessionServices {
            destinations,
            tenants: TenantManagement::new(&config.tenants),
            transactions,
            wills,
            store: storage.sessions.clone(),
            scheduler,
            keep_alive_grace: config.sessions.keep_alive_grace(),
        });
        let pipelines = (0..config.sessions.pipelines)
            .map(|index| {
                Arc::new(Pipeline {
                    index,
                    state: Mutex::new(PipelineState::default()),
                })
            })
            .collect();
        Arc::new_cyclic(|self_ref| Self {
            config: config.sessions.clone(),
            security,
            services,
            pipelines,
            next_internal_id: AtomicU64::new(1),
            counters: Counters::default(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn wills(&self) -> &Arc<WillTaskRegistry> {
        &self.services.wills
    }

    pub fn transactions(&self) -> &Arc<TransactionRegistry> {
        &self.services.transactions
    }

    pub fn destinations(&self) -> &Arc<dyn DestinationFactory> {
        &self.services.destinations
    }

    fn store(&self) -> &SessionDetailStore {
        &self.services.store
    }

    fn pipeline_for(&self, session_id: &str) -> Result<&Arc<Pipeline>, SessionError> {
        if self.pipelines.is_empty() {
            return Err(SessionError::NoPipelines);
        }
        Ok(&self.pipelines[pipeline_index(session_id, self.pipelines.len())])
    }

    /// Start background work and rebuild state persisted by a previous run:
    /// hibernated controllers (with their stored expiry) and pending wills.
    /// Returns the number of reloaded sessions.
    pub async fn start(&self) -> usize {
        self.services
            .transactions
            .start(&self.services.scheduler);
        let persisted = match self.store().load_all() {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!("unable to reload persisted sessions: {err}");
                Vec::new()
            }
        };
        let highest = persisted.iter().map(|d| d.internal_id).max().unwrap_or(0);
        self.next_internal_id
            .fetch_max(highest + 1, Ordering::AcqRel);

        let mut reloaded = 0;
        for details in persisted {
            if details.subscriptions.is_empty() {
                continue;
            }
            if let Err(err) = self.reload(details).await {
                warn!("unable to reload session: {err}");
                continue;
            }
            reloaded += 1;
        }
        let wills = self.services.wills.start();
        info!(sessions = reloaded, wills, "session manager started");
        reloaded
    }

    async fn reload(&self, details: SessionDetails) -> Result<(), SessionError> {
        let controller = SubscriptionController::new(
            details.session_id.clone(),
            details.unique_id.clone(),
            true,
            self.services.destinations.clone(),
        );
        controller.set_backlog_limit(self.config.backlog_limit);
        controller.restore(details.subscriptions.clone()).await;
        let pipeline = self.pipeline_for(&details.session_id)?;
        let mut state = pipeline.state.lock();
        if state.sessions.contains_key(&details.session_id)
            || state.controllers.contains_key(&details.session_id)
        {
            controller.close();
            return Ok(());
        }
        state
            .controllers
            .insert(details.session_id.clone(), controller.clone());
        if controller.park() {
            self.counters.disconnected.fetch_add(1, Ordering::AcqRel);
        }
        self.arm_expiry(
            pipeline,
            &controller,
            Duration::from_secs(details.expiry_secs),
        );
        debug!(
            session_id = %details.session_id,
            pipeline = pipeline.index,
            subscriptions = controller.len(),
            "reloaded hibernated session"
        );
        Ok(())
    }

    /// Stop background timers. Live and hibernated state stays in memory.
    pub fn stop(&self) {
        self.services.transactions.stop();
        self.services.wills.stop();
        for pipeline in &self.pipelines {
            let state = pipeline.state.lock();
            for controller in state.controllers.values() {
                if let Some(timeout) = controller.take_timeout() {
                    timeout.cancel();
                }
            }
        }
        info!("session manager stopped");
    }

    /// Authenticate and register a live session, closing any previous live
    /// session of the same identity first.
    pub fn create(&self, context: SessionContext) -> Result<Arc<Session>, SessionError> {
        let pipeline = self.pipeline_for(context.session_id())?;
        let mut security = self
            .security
            .get_security_context(&context.auth())
            .map_err(|err| {
                warn!(session_id = %context.session_id(), "authentication failed: {err}");
                err
            })?;
        security.login()?;

        let session_id = context.session_id().to_string();
        let mut teardowns = Vec::new();
        let created = {
            let mut state = pipeline.state.lock();
            let displaced = state.sessions.remove(&session_id);
            if let Some(old) = &displaced {
                self.take_over(&mut state, old);
            }
            let (controller, restored, details) =
                self.load_subscription_controller(&mut state, &context, &mut teardowns);
            let session = Session::new(
                context,
                security,
                controller.clone(),
                &details,
                restored,
                self.services.clone(),
                Arc::downgrade(pipeline),
            );
            session.login().map(|()| {
                controller.wake(session.delivery_target());
                state.sessions.insert(session_id.clone(), session.clone());
                (session, displaced)
            })
        };
        for teardown in teardowns {
            teardown.finish(&self.services.wills);
        }
        let (session, displaced) = created?;
        self.counters.connected.fetch_add(1, Ordering::AcqRel);
        if let Some(old) = displaced {
            old.run_closure_tasks();
        }
        session.start_keep_alive();
        info!(
            session_id = %session_id,
            pipeline = pipeline.index,
            internal_id = session.internal_id(),
            restored = session.is_restored(),
            "session created"
        );
        Ok(session)
    }

    pub async fn create_async(
        self: &Arc<Self>,
        context: SessionContext,
    ) -> Result<Arc<Session>, SessionError> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.create(context))
            .await
            .map_err(|err| SessionError::Background(err.to_string()))?
    }

    fn take_over(&self, state: &mut PipelineState, old: &Arc<Session>) {
        old.close();
        Counters::decrement(&self.counters.connected);
        let controller = old.controller();
        if state
            .controllers
            .get(old.session_id())
            .is_some_and(|c| Arc::ptr_eq(c, controller))
        {
            controller.hibernate_all();
        } else {
            controller.close();
        }
        info!(session_id = %old.session_id(), "live session taken over");
    }

    fn load_subscription_controller(
        &self,
        state: &mut PipelineState,
        context: &SessionContext,
        teardowns: &mut Vec<Teardown>,
    ) -> (Arc<SubscriptionController>, bool, SessionDetails) {
        let session_id = context.session_id();
        let expiry_secs = self.config.resolve_expiry(context.requested_expiry());
        while let Some(existing) = state.controllers.get(session_id).cloned() {
            if let Some(timeout) = existing.take_timeout() {
                if !timeout.cancel() {
                    // expiry fired and is waiting on this lock
                    teardowns.extend(self.close_subscription_controller(state, &existing, true));
                    continue;
                }
            }
            if context.reset_state() || existing.is_closed() {
                state.controllers.remove(session_id);
                if existing.unpark() {
                    Counters::decrement(&self.counters.disconnected);
                }
                existing.close();
                debug!(session_id = %session_id, "discarded previous subscription state");
                break;
            }
            if existing.unpark() {
                Counters::decrement(&self.counters.disconnected);
            }
            let mut details = self.session_details(session_id, &existing);
            details.expiry_secs = expiry_secs;
            details.subscriptions = existing.contexts();
            if existing.is_persistent() {
                self.put_details(&details);
            }
            return (existing, true, details);
        }

        if context.reset_state() {
            if let Err(err) = self.store().remove(session_id) {
                warn!(session_id = %session_id, "unable to clear session details: {err}");
            }
        }
        let mut details = match self.store().get(session_id) {
            Ok(Some(details)) => details,
            Ok(None) => SessionDetails::new(session_id, self.next_internal_id()),
            Err(err) => {
                warn!(session_id = %session_id, "unable to read session details: {err}");
                SessionDetails::new(session_id, self.next_internal_id())
            }
        };
        let controller = SubscriptionController::new(
            session_id,
            details.unique_id.clone(),
            context.is_persistent(),
            self.services.destinations.clone(),
        );
        controller.set_backlog_limit(self.config.backlog_limit);
        let stale = std::mem::take(&mut details.subscriptions);
        if !stale.is_empty() && context.is_persistent() {
            let restoring = controller.clone();
            self.services.scheduler.spawn(async move {
                restoring.restore(stale).await;
            });
        }
        details.persistent = context.is_persistent();
        details.expiry_secs = expiry_secs;
        if context.is_persistent() {
            state
                .controllers
                .insert(session_id.to_string(), controller.clone());
            self.put_details(&details);
        }
        (controller, false, details)
    }

    fn session_details(&self, session_id: &str, controller: &SubscriptionController) -> SessionDetails {
        match self.store().get(session_id) {
            Ok(Some(details)) => details,
            Ok(None) => SessionDetails {
                unique_id: controller.unique_id().to_string(),
                ..SessionDetails::new(session_id, self.next_internal_id())
            },
            Err(err) => {
                warn!(session_id = %session_id, "unable to read session details: {err}");
                SessionDetails {
                    unique_id: controller.unique_id().to_string(),
                    ..SessionDetails::new(session_id, self.next_internal_id())
                }
            }
        }
    }

    fn next_internal_id(&self) -> u64 {
        self.next_internal_id.fetch_add(1, Ordering::AcqRel)
    }

    fn put_details(&self, details: &SessionDetails) {
        if let Err(err) = self.store().put(details) {
            warn!(session_id = %details.session_id, "unable to persist session details: {err}");
        }
    }

    /// Close a live session. With `clear_will` the pending will is dropped,
    /// otherwise it is scheduled. A non-zero expiry hibernates the
    /// subscription controller until the expiry timer tears it down.
    pub fn close(&self, session: &Arc<Session>, clear_will: bool) {
        let session_id = session.session_id();
        let Ok(pipeline) = self.pipeline_for(session_id) else {
            session.close();
            session.run_closure_tasks();
            return;
        };
        let mut cleared = false;
        let teardown = {
            let mut state = pipeline.state.lock();
            let current = state
                .sessions
                .get(session_id)
                .is_some_and(|live| Arc::ptr_eq(live, session));
            if !current {
                drop(state);
                // superseded by a newer session of the same identity
                if session.close() {
                    debug!(session_id = %session_id, "closed superseded session");
                }
                session.run_closure_tasks();
                return;
            }
            state.sessions.remove(session_id);
            session.close();
            Counters::decrement(&self.counters.connected);

            if clear_will {
                if let Some(will) = self.services.wills.take(session_id) {
                    will.discard();
                    cleared = true;
                }
            } else if let Some(will) = self.services.wills.get(session_id) {
                will.schedule();
            }

            let controller = session.controller().clone();
            if session.expiry() > Duration::ZERO {
                controller.hibernate_all();
                state
                    .controllers
                    .insert(session_id.to_string(), controller.clone());
                if controller.park() {
                    self.counters.disconnected.fetch_add(1, Ordering::AcqRel);
                }
                self.arm_expiry(pipeline, &controller, session.expiry());
                session.persist_details();
                info!(
                    session_id = %session_id,
                    pipeline = pipeline.index,
                    expiry_secs = session.expiry().as_secs(),
                    "session hibernated"
                );
                None
            } else {
                info!(session_id = %session_id, pipeline = pipeline.index, "session closed");
                self.close_subscription_controller(&mut state, &controller, false)
            }
        };
        if cleared {
            self.services.wills.forget(session_id);
        }
        if let Some(teardown) = teardown {
            teardown.finish(&self.services.wills);
        }
        session.run_closure_tasks();
    }

    pub async fn close_async(self: &Arc<Self>, session: Arc<Session>, clear_will: bool) -> Result<(), SessionError> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.close(&session, clear_will))
            .await
            .map_err(|err| SessionError::Background(err.to_string()))
    }

    fn arm_expiry(&self, pipeline: &Arc<Pipeline>, controller: &Arc<SubscriptionController>, expiry: Duration) {
        let manager = self.self_ref.clone();
        let pipeline_ref = Arc::downgrade(pipeline);
        let target = Arc::downgrade(controller);
        let task = self.services.scheduler.schedule(expiry, move || {
            let (Some(manager), Some(pipeline), Some(controller)) =
                (manager.upgrade(), pipeline_ref.upgrade(), target.upgrade())
            else {
                return;
            };
            let teardown = {
                let mut state = pipeline.state.lock();
                manager.close_subscription_controller(&mut state, &controller, true)
            };
            if let Some(teardown) = teardown {
                teardown.finish(&manager.services.wills);
            }
        });
        controller.set_timeout(task);
    }

    /// Final teardown of a subscription controller. The identity's pending
    /// will is taken here and fired unconditionally by [`Teardown::finish`]
    /// once the lock is released. Idempotent: `None` if already closed.
    fn close_subscription_controller(
        &self,
        state: &mut PipelineState,
        controller: &Arc<SubscriptionController>,
        expired: bool,
    ) -> Option<Teardown> {
        if controller.is_closed() {
            return None;
        }
        let session_id = controller.session_id();
        if state
            .controllers
            .get(session_id)
            .is_some_and(|c| Arc::ptr_eq(c, controller))
        {
            state.controllers.remove(session_id);
        }
        let will = self.services.wills.take(session_id);
        controller.close();
        if controller.unpark() {
            Counters::decrement(&self.counters.disconnected);
        }
        if expired {
            self.counters.expired.fetch_add(1, Ordering::AcqRel);
            info!(session_id = %session_id, "hibernated session expired");
        }
        // a create that follows reads the details under this same lock
        if let Err(err) = self.store().remove(session_id) {
            warn!(session_id = %session_id, "unable to remove session details: {err}");
        }
        Some(Teardown {
            session_id: session_id.to_string(),
            will,
        })
    }

    /// Publish on a fully-qualified destination on behalf of the broker.
    pub async fn publish(&self, destination: &str, message: Message) -> Result<u64, SessionError> {
        let destination = self
            .services
            .destinations
            .find_or_create(destination, DestinationType::Topic)
            .await?;
        Ok(destination.publish(message)?)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        let pipeline = self.pipeline_for(session_id).ok()?;
        let state = pipeline.state.lock();
        state.sessions.get(session_id).cloned()
    }

    /// Retained controller of `session_id`, live or hibernated.
    pub fn controller(&self, session_id: &str) -> Option<Arc<SubscriptionController>> {
        let pipeline = self.pipeline_for(session_id).ok()?;
        let state = pipeline.state.lock();
        state.controllers.get(session_id).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .pipelines
            .iter()
            .flat_map(|pipeline| {
                let state = pipeline.state.lock();
                state.sessions.values().map(|s| s.info()).collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    /// Identities whose subscription state is retained without a live session.
    pub fn hibernated(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .pipelines
            .iter()
            .flat_map(|pipeline| {
                let state = pipeline.state.lock();
                state
                    .controllers
                    .iter()
                    .filter(|(id, c)| !state.sessions.contains_key(*id) && c.is_hibernating())
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort();
        out
    }

    pub fn connected(&self) -> u64 {
        self.counters.connected.load(Ordering::Acquire)
    }

    pub fn disconnected(&self) -> u64 {
        self.counters.disconnected.load(Ordering::Acquire)
    }

    pub fn expired(&self) -> u64 {
        self.counters.expired.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Result<ManagerStatus, SessionError> {
        if self.pipelines.is_empty() {
            return Err(SessionError::NoPipelines);
        }
        Ok(ManagerStatus {
            pipelines: self.pipelines.len(),
            connected: self.connected(),
            disconnected: self.disconnected(),
            expired: self.expired(),
            pending_wills: self.services.wills.len(),
            open_transactions: self.services.transactions.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::destination::Qos;
    use crate::messaging::memory::MemoryDestinationFactory;
    use crate::messaging::subscriptions::SubscriptionContext;
    use crate::net::connection::LocalConnection;
    use crate::net::security::AnonymousSecurityManager;
    use crate::session::WillRequest;
    use bytes::Bytes;

    fn manager() -> (Arc<SessionManager>, Arc<MemoryDestinationFactory>) {
        let mut config = EngineConfig::default();
        config.sessions.pipelines = 4;
        let destinations = MemoryDestinationFactory::new();
        let manager = SessionManager::new(
            &config,
            Arc::new(AnonymousSecurityManager),
            destinations.clone(),
            Storage::in_memory(),
            TaskScheduler::current().unwrap(),
        );
        (manager, destinations)
    }

    fn context(session_id: &str, payload: &'static [u8]) -> SessionContext {
        SessionContext::builder(session_id, Arc::new(LocalConnection::new(session_id, "mqtt")))
            .persistent(true)
            .expiry_secs(5)
            .will(WillRequest {
                destination: "status/offline".into(),
                payload: Bytes::from_static(payload),
                qos: Qos::AtLeastOnce,
                retain: false,
                delay_secs: 60,
            })
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_expiry_fired_tears_down_and_starts_fresh() {
        let (manager, destinations) = manager();
        let first = manager.create(context("c1", b"first")).unwrap();
        first
            .add_subscription(SubscriptionContext::new("s1", "room/1"))
            .await
            .unwrap();
        manager.close(&first, false);
        let old = manager.controller("c1").unwrap();
        assert!(old.has_timeout());

        // expiry timer fired and its callback is still waiting for the pipeline lock
        let fired = manager.services.scheduler.schedule(Duration::ZERO, || {});
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(fired.has_fired());
        old.set_timeout(fired);

        let second = manager.create(context("c1", b"second")).unwrap();
        assert!(!second.is_restored());
        assert!(!Arc::ptr_eq(second.controller(), &old));
        assert!(second.controller().is_empty());
        assert!(old.is_closed());
        assert_eq!(manager.expired(), 1);
        assert_eq!(manager.wills().fired(), 1);
        assert_eq!(destinations.store("room/1").unwrap().subscribers(), 0);

        // the late expiry callback finds the old controller closed
        {
            let pipeline = manager.pipeline_for("c1").unwrap().clone();
            let mut state = pipeline.state.lock();
            assert!(manager
                .close_subscription_controller(&mut state, &old, true)
                .is_none());
        }
        let current = manager.controller("c1").unwrap();
        assert!(Arc::ptr_eq(&current, second.controller()));
        assert!(!current.is_closed());
        assert_eq!(manager.expired(), 1);
        assert_eq!(manager.wills().fired(), 1);
        assert_eq!(
            manager.wills().get("c1").unwrap().details().payload,
            Bytes::from_static(b"second")
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        let published = destinations.committed("status/offline");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, Bytes::from_static(b"first"));
        manager.stop();
    }

    #[test]
    fn pipeline_index_is_stable_and_in_range() {
        for pipelines in [1, 3, 8, 64] {
            for id in ["client-1", "client-2", "", "ünï"] {
                let idx = pipeline_index(id, pipelines);
                assert!(idx < pipelines);
                assert_eq!(idx, pipeline_index(id, pipelines));
            }
        }
        assert_eq!(pipeline_index("anything", 1), 0);
    }

    #[test]
    fn identities_spread_over_pipelines() {
        let mut seen = std::collections::HashSet::new();
        for n in 0..200 {
            seen.insert(pipeline_index(&format!("client-{n}"), 8));
        }
        assert_eq!(seen.len(), 8);
    }
}
