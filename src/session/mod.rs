//! Live sessions handed to protocol adapters.
//!
//! A [`Session`] couples the authenticated security context, the identity's
//! [`SubscriptionController`], the tenant namespace and a destination cache.
//! Sessions are created and closed through [`manager::SessionManager`]; every
//! operation on a closed session fails with [`SessionError::Closed`].

pub mod manager;

use crate::core::time::{ScheduledTask, TaskScheduler};
use crate::messaging::destination::{
    Destination, DestinationError, DestinationFactory, DestinationType, Message, Qos,
};
use crate::messaging::namespace::{NamespaceMap, TenantManagement};
use crate::messaging::subscriptions::{
    Completion, DeliveryTarget, SubscriptionContext, SubscriptionController, SubscriptionError,
    SubscriptionHandle,
};
use crate::messaging::transactions::{Transaction, TransactionError, TransactionRegistry};
use crate::messaging::will::{WillDetails, WillTaskRegistry};
use crate::net::connection::ClientConnection;
use crate::net::security::{Access, AuthContext, SecurityContext, SecurityError};
use crate::storage::{SessionDetailStore, SessionDetails};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use manager::{ManagerStatus, SessionManager};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] SecurityError),
    #[error("session {0} is closed")]
    Closed(String),
    #[error("transaction {0} is already open")]
    DuplicateTransaction(String),
    #[error("access to {0} denied")]
    AccessDenied(String),
    #[error("no session pipelines configured")]
    NoPipelines,
    #[error("background task failed: {0}")]
    Background(String),
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Will requested by the client at connect time. The destination is
/// client-relative and mapped into the tenant namespace on login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillRequest {
    pub destination: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub delay_secs: u64,
}

/// Connection request built by a protocol adapter. Immutable once built.
#[derive(Clone)]
pub struct SessionContext {
    session_id: String,
    connection: Arc<dyn ClientConnection>,
    username: Option<String>,
    password: Option<Vec<u8>>,
    persistent: bool,
    expiry: i64,
    receive_maximum: u32,
    will: Option<WillRequest>,
    reset_state: bool,
}

impl SessionContext {
    pub fn builder(
        session_id: impl Into<String>,
        connection: Arc<dyn ClientConnection>,
    ) -> SessionContextBuilder {
        SessionContextBuilder {
            context: SessionContext {
                session_id: session_id.into(),
                connection,
                username: None,
                password: None,
                persistent: false,
                expiry: 0,
                receive_maximum: 65_535,
                will: None,
                reset_state: false,
            },
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection(&self) -> &Arc<dyn ClientConnection> {
        &self.connection
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Requested expiry in seconds; negative asks for the configured default.
    pub fn requested_expiry(&self) -> i64 {
        self.expiry
    }

    pub fn receive_maximum(&self) -> u32 {
        self.receive_maximum
    }

    pub fn will(&self) -> Option<&WillRequest> {
        self.will.as_ref()
    }

    pub fn reset_state(&self) -> bool {
        self.reset_state
    }

    pub fn auth(&self) -> AuthContext<'_> {
        AuthContext {
            session_id: &self.session_id,
            protocol: self.connection.protocol(),
            username: self.username.as_deref(),
            password: self.password.as_deref(),
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("protocol", &self.connection.protocol())
            .field("username", &self.username)
            .field("persistent", &self.persistent)
            .field("expiry", &self.expiry)
            .field("reset_state", &self.reset_state)
            .finish()
    }
}

pub struct SessionContextBuilder {
    context: SessionContext,
}

impl SessionContextBuilder {
    pub fn credentials(mut self, username: impl Into<String>, password: impl AsRef<[u8]>) -> Self {
        self.context.username = Some(username.into());
        self.context.password = Some(password.as_ref().to_vec());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.context.username = Some(username.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.context.persistent = persistent;
        self
    }

    pub fn expiry_secs(mut self, expiry: i64) -> Self {
        self.context.expiry = expiry;
        self
    }

    pub fn receive_maximum(mut self, receive_maximum: u32) -> Self {
        self.context.receive_maximum = receive_maximum.max(1);
        self
    }

    pub fn will(mut self, will: WillRequest) -> Self {
        self.context.will = Some(will);
        self
    }

    pub fn reset_state(mut self, reset: bool) -> Self {
        self.context.reset_state = reset;
        self
    }

    pub fn build(self) -> SessionContext {
        self.context
    }
}

/// What a protocol adapter receives per delivered message.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Client-visible destination name.
    pub destination: String,
    pub alias: String,
    pub message: Message,
}

/// Adapter callback. `completion` must be completed once ack/credit handling is done.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, delivery: Delivery, completion: Completion);
}

/// Collaborators shared by every session of one manager.
pub(crate) struct SessionServices {
    pub destinations: Arc<dyn DestinationFactory>,
    pub tenants: TenantManagement,
    pub transactions: Arc<TransactionRegistry>,
    pub wills: Arc<WillTaskRegistry>,
    pub store: SessionDetailStore,
    pub scheduler: TaskScheduler,
    pub keep_alive_grace: Duration,
}

type ClosureTask = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub unique_id: String,
    pub internal_id: u64,
    pub username: Option<String>,
    pub protocol: String,
    pub persistent: bool,
    pub expiry_secs: u64,
    pub restored: bool,
    pub subscriptions: usize,
}

pub struct Session {
    context: SessionContext,
    unique_id: String,
    internal_id: u64,
    expiry: Duration,
    restored: bool,
    security: Mutex<Box<dyn SecurityContext>>,
    controller: Arc<SubscriptionController>,
    namespace: Mutex<Arc<NamespaceMap>>,
    cache: Mutex<HashMap<String, Destination>>,
    transactions: Mutex<HashMap<String, Arc<Transaction>>>,
    listener: Mutex<Option<Arc<dyn MessageListener>>>,
    keep_alive: Mutex<Option<ScheduledTask>>,
    closure_tasks: Mutex<Vec<ClosureTask>>,
    closed: AtomicBool,
    services: Arc<SessionServices>,
    domain: Weak<manager::Pipeline>,
    self_ref: Weak<Session>,
}

impl Session {
    pub(crate) fn new(
        context: SessionContext,
        security: Box<dyn SecurityContext>,
        controller: Arc<SubscriptionController>,
        details: &SessionDetails,
        restored: bool,
        services: Arc<SessionServices>,
        domain: Weak<manager::Pipeline>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            unique_id: details.unique_id.clone(),
            internal_id: details.internal_id,
            expiry: Duration::from_secs(details.expiry_secs),
            restored,
            security: Mutex::new(security),
            controller,
            namespace: Mutex::new(Arc::new(NamespaceMap::default())),
            cache: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            keep_alive: Mutex::new(None),
            closure_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            services,
            domain,
            self_ref: self_ref.clone(),
            context,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn internal_id(&self) -> u64 {
        self.internal_id
    }

    /// Hibernation expiry; zero tears the subscriptions down on close.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// A hibernated subscription controller was reclaimed by this session.
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    pub fn is_persistent(&self) -> bool {
        self.controller.is_persistent()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn username(&self) -> Option<String> {
        self.security.lock().username().map(str::to_string)
    }

    pub fn controller(&self) -> &Arc<SubscriptionController> {
        &self.controller
    }

    pub fn namespace(&self) -> Arc<NamespaceMap> {
        self.namespace.lock().clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id().to_string(),
            unique_id: self.unique_id.clone(),
            internal_id: self.internal_id,
            username: self.username(),
            protocol: self.context.connection.protocol().to_string(),
            persistent: self.is_persistent(),
            expiry_secs: self.expiry.as_secs(),
            restored: self.restored,
            subscriptions: self.controller.len(),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed(self.session_id().to_string()))
        } else {
            Ok(())
        }
    }

    fn ensure_access(&self, fqn: &str, access: Access) -> Result<(), SessionError> {
        if self.security.lock().can_access(fqn, access) {
            Ok(())
        } else {
            warn!(session_id = %self.session_id(), destination = %fqn, ?access, "access denied");
            Err(SessionError::AccessDenied(fqn.to_string()))
        }
    }

    /// Complete authentication, resolve the tenant namespace and install the will.
    pub fn login(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let username = {
            let mut security = self.security.lock();
            if !security.is_logged_in() {
                security.login()?;
            }
            security.username().map(str::to_string)
        };
        let resolver = self
            .services
            .tenants
            .resolve(username.as_deref(), self.context.connection.protocol());
        let namespace = Arc::new(NamespaceMap::new(resolver));
        *self.namespace.lock() = namespace.clone();

        match &self.context.will {
            Some(will) => {
                self.services.wills.replace(WillDetails {
                    session_id: self.session_id().to_string(),
                    destination: namespace.map(&will.destination),
                    payload: will.payload.clone(),
                    qos: will.qos,
                    retain: will.retain,
                    delay_secs: will.delay_secs,
                });
            }
            None => {
                if let Some(previous) = self.services.wills.remove(self.session_id()) {
                    previous.discard();
                }
            }
        }
        debug!(session_id = %self.session_id(), user = ?username, "session logged in");
        Ok(())
    }

    pub fn set_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.listener.lock() = Some(listener);
        self.controller.flush();
    }

    /// Register a callback run once when the session closes.
    pub fn add_closure_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            task();
            return;
        }
        self.closure_tasks.lock().push(Box::new(task));
    }

    pub async fn find_destination(
        &self,
        name: &str,
        kind: DestinationType,
    ) -> Result<Destination, SessionError> {
        self.ensure_open()?;
        let fqn = self.namespace().map(name);
        self.ensure_access(&fqn, Access::Read)?;
        if let Some(destination) = self.cache.lock().get(&fqn) {
            return Ok(destination.clone());
        }
        let destination = self
            .services
            .destinations
            .find_or_create(&fqn, kind)
            .await?;
        self.ensure_open()?;
        self.cache.lock().insert(fqn, destination.clone());
        Ok(destination)
    }

    pub async fn delete_destination(&self, name: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        let namespace = self.namespace();
        let fqn = namespace.map(name);
        self.ensure_access(&fqn, Access::Write)?;
        self.cache.lock().remove(&fqn);
        namespace.forget(&fqn);
        match self.services.destinations.find(&fqn).await? {
            Some(destination) => {
                self.services.destinations.delete(&destination).await?;
                info!(session_id = %self.session_id(), destination = %fqn, "destination deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Publish outside any transaction. Returns the stored message id.
    pub async fn publish(&self, name: &str, message: Message) -> Result<u64, SessionError> {
        let destination = self.find_destination(name, DestinationType::Topic).await?;
        self.ensure_access(destination.name(), Access::Write)?;
        Ok(destination.publish(message)?)
    }

    pub async fn add_subscription(
        &self,
        mut context: SubscriptionContext,
    ) -> Result<SubscriptionHandle, SessionError> {
        self.ensure_open()?;
        context.destination_name = self.namespace().map(&context.destination_name);
        self.ensure_access(&context.destination_name, Access::Read)?;
        context.allocated_id = self.internal_id;
        if context.receive_maximum.is_none() {
            context.receive_maximum = Some(self.context.receive_maximum);
        }
        self.attach(SubscriptionController::wake)?;
        let handle = self.controller.add_subscription(context).await?;
        self.persist_details();
        Ok(handle)
    }

    pub fn remove_subscription(&self, alias: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        let removed = self.controller.remove_subscription(alias);
        if removed {
            self.persist_details();
        }
        Ok(removed)
    }

    pub fn hibernate_subscription(&self, alias: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(self.controller.hibernate_subscription(alias))
    }

    pub fn grant_credit(&self, alias: &str, credit: u32) -> Result<(), SessionError> {
        self.ensure_open()?;
        Ok(self.controller.grant_credit(alias, credit)?)
    }

    /// Resume delivery on every subscription of a reclaimed controller.
    pub fn resume_state(&self) -> Result<(), SessionError> {
        self.attach(SubscriptionController::wake_all)?;
        self.controller.flush();
        Ok(())
    }

    /// Resume delivery on the subscriptions bound to one destination.
    pub fn resume(&self, name: &str) -> Result<Option<SubscriptionHandle>, SessionError> {
        self.ensure_open()?;
        let fqn = self.namespace().map(name);
        let handle = self.attach(|controller, owner| controller.wake_destination(owner, &fqn))?;
        self.controller.flush();
        Ok(handle)
    }

    pub fn start_transaction(&self, id: &str) -> Result<Arc<Transaction>, SessionError> {
        self.ensure_open()?;
        let mut transactions = self.transactions.lock();
        if let Some(existing) = transactions.get(id) {
            if !existing.state().is_terminal() {
                return Err(SessionError::DuplicateTransaction(id.to_string()));
            }
            self.services.transactions.remove(existing.internal_id());
        }
        let txn = self.services.transactions.begin(id);
        transactions.insert(id.to_string(), txn.clone());
        Ok(txn)
    }

    pub fn transaction(&self, id: &str) -> Option<Arc<Transaction>> {
        self.transactions.lock().get(id).cloned()
    }

    /// Stage a publish on `name` under the session transaction `id`.
    pub async fn publish_transactional(
        &self,
        id: &str,
        name: &str,
        message: Message,
    ) -> Result<(), SessionError> {
        let txn = self
            .transaction(id)
            .ok_or_else(|| TransactionError::AlreadyCompleted {
                id: id.to_string(),
                state: "closed",
            })?;
        let destination = self.find_destination(name, DestinationType::Topic).await?;
        self.ensure_access(destination.name(), Access::Write)?;
        Ok(txn.add(&destination, message)?)
    }

    pub fn commit_transaction(&self, id: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        let txn = self.take_transaction(id)?;
        Ok(txn.commit()?)
    }

    pub fn abort_transaction(&self, id: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        let txn = self.take_transaction(id)?;
        Ok(txn.abort()?)
    }

    fn take_transaction(&self, id: &str) -> Result<Arc<Transaction>, SessionError> {
        let txn = self.transactions.lock().remove(id).ok_or_else(|| {
            TransactionError::AlreadyCompleted {
                id: id.to_string(),
                state: "closed",
            }
        })?;
        self.services.transactions.remove(txn.internal_id());
        Ok(txn)
    }

    /// Attach this session to its controller under the identity's pipeline
    /// lock, where it is ordered against close. Fails once closed.
    fn attach<R>(
        &self,
        f: impl FnOnce(&SubscriptionController, Weak<dyn DeliveryTarget>) -> R,
    ) -> Result<R, SessionError> {
        let closed = || SessionError::Closed(self.session_id().to_string());
        let pipeline = self.domain.upgrade().ok_or_else(closed)?;
        pipeline.serialize(|| {
            self.ensure_open()?;
            Ok(f(self.controller.as_ref(), self.delivery_target()))
        })
    }

    fn delivery_target(&self) -> Weak<dyn DeliveryTarget> {
        let target: Weak<dyn DeliveryTarget> = self.self_ref.clone();
        target
    }

    pub(crate) fn details(&self) -> SessionDetails {
        SessionDetails {
            session_id: self.session_id().to_string(),
            unique_id: self.unique_id.clone(),
            internal_id: self.internal_id,
            persistent: self.controller.is_persistent(),
            expiry_secs: self.expiry.as_secs(),
            subscriptions: self.controller.contexts(),
        }
    }

    pub(crate) fn persist_details(&self) {
        if !self.controller.is_persistent() {
            return;
        }
        if let Err(err) = self.services.store.put(&self.details()) {
            warn!(session_id = %self.session_id(), "unable to persist session details: {err}");
        }
    }

    pub(crate) fn start_keep_alive(&self) {
        let keep_alive = self.context.connection.keep_alive();
        if keep_alive.is_zero() {
            return;
        }
        let limit = keep_alive + self.services.keep_alive_grace;
        let session = self.self_ref.clone();
        let clock = self.services.scheduler.clock().clone();
        let task = self.services.scheduler.schedule_at_fixed_rate(limit, move || {
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_closed() {
                return;
            }
            let connection = &session.context.connection;
            let idle = clock.now().saturating_duration_since(connection.last_activity());
            if idle > limit {
                warn!(session_id = %session.session_id(), idle_ms = idle.as_millis() as u64, "keep-alive expired");
                connection.keep_alive_expired(idle);
            }
        });
        if let Some(previous) = self.keep_alive.lock().replace(task) {
            previous.cancel();
        }
    }

    /// Move out of the live state. Returns `false` if already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.security.lock().logout();
        if let Some(task) = self.keep_alive.lock().take() {
            task.cancel();
        }
        let transactions: Vec<Arc<Transaction>> =
            self.transactions.lock().drain().map(|(_, txn)| txn).collect();
        for txn in transactions {
            txn.close();
            self.services.transactions.remove(txn.internal_id());
        }
        self.cache.lock().clear();
        self.listener.lock().take();
        debug!(session_id = %self.session_id(), "session closed");
        true
    }

    pub(crate) fn run_closure_tasks(&self) {
        let tasks = std::mem::take(&mut *self.closure_tasks.lock());
        for task in tasks {
            task();
        }
    }
}

impl DeliveryTarget for Session {
    fn is_ready(&self) -> bool {
        !self.is_closed() && self.listener.lock().is_some()
    }

    fn deliver(&self, alias: &str, destination: &str, message: Message, completion: Completion) {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) if !self.is_closed() => {
                let destination = self.namespace().original(destination);
                listener.on_message(
                    Delivery {
                        destination,
                        alias: alias.to_string(),
                        message,
                    },
                    completion,
                );
            }
            // dropping the completion requeues the message
            _ => drop(completion),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("internal_id", &self.internal_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
