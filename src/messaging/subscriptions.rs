//! Per-identity subscription registry.
//!
//! A [`SubscriptionController`] outlives the session that created it when the
//! session hibernates. Each subscription moves `active <-> hibernated -> closed`;
//! while hibernated (or out of credit) messages are parked in a FIFO backlog and
//! flushed once the subscription is active again.

use crate::core::time::ScheduledTask;
use crate::messaging::destination::{
    Destination, DestinationError, DestinationFactory, DestinationType, Message, MessageSink, Qos,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};

static SINK_IDS: AtomicU64 = AtomicU64::new(1);

const DEFAULT_RECEIVE_MAXIMUM: u32 = 65_535;

/// Messages buffered per subscription before the oldest are dropped. The
/// destination engine keeps its own copy for redelivery.
pub const DEFAULT_BACKLOG_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription controller for {0} is closed")]
    ControllerClosed(String),
    #[error("unknown subscription {0}")]
    UnknownSubscription(String),
    #[error(transparent)]
    Destination(#[from] DestinationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    Auto,
    Client,
    Individual,
}

/// Who replenishes delivery credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditMode {
    /// Credit comes back when the adapter completes a delivery.
    Server,
    /// Credit only grows through explicit grants from the client.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainHandler {
    SendAlways,
    SendIfNew,
    DoNotSend,
}

/// Everything needed to (re)build one subscription. Persisted for durable sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionContext {
    pub alias: String,
    pub destination_name: String,
    pub destination_type: DestinationType,
    pub qos: Qos,
    pub ack_mode: AckMode,
    pub credit_mode: CreditMode,
    pub retain_handler: RetainHandler,
    #[serde(default)]
    pub receive_maximum: Option<u32>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub shared_name: Option<String>,
    #[serde(default)]
    pub no_local: bool,
    /// Internal id of the session that registered the subscription.
    #[serde(default)]
    pub allocated_id: u64,
}

impl SubscriptionContext {
    pub fn new(alias: impl Into<String>, destination_name: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            destination_name: destination_name.into(),
            destination_type: DestinationType::Topic,
            qos: Qos::AtMostOnce,
            ack_mode: AckMode::Auto,
            credit_mode: CreditMode::Server,
            retain_handler: RetainHandler::SendAlways,
            receive_maximum: None,
            selector: None,
            shared_name: None,
            no_local: false,
            allocated_id: 0,
        }
    }

    pub fn with_type(mut self, destination_type: DestinationType) -> Self {
        self.destination_type = destination_type;
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_credit_mode(mut self, credit_mode: CreditMode) -> Self {
        self.credit_mode = credit_mode;
        self
    }

    pub fn with_retain_handler(mut self, retain_handler: RetainHandler) -> Self {
        self.retain_handler = retain_handler;
        self
    }

    pub fn with_receive_maximum(mut self, receive_maximum: u32) -> Self {
        self.receive_maximum = Some(receive_maximum);
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_shared_name(mut self, shared_name: impl Into<String>) -> Self {
        self.shared_name = Some(shared_name.into());
        self
    }

    fn initial_credit(&self) -> u32 {
        match self.credit_mode {
            CreditMode::Server => self.receive_maximum.unwrap_or(DEFAULT_RECEIVE_MAXIMUM),
            CreditMode::Client => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    Hibernated,
}

/// Receiver of messages for an attached (live) controller. Implemented by the session.
pub trait DeliveryTarget: Send + Sync {
    /// Whether deliveries can currently be handed over.
    fn is_ready(&self) -> bool;
    /// Hand a message to the protocol adapter. Dropping `completion` without
    /// completing it puts the message back at the head of the backlog.
    fn deliver(&self, alias: &str, destination: &str, message: Message, completion: Completion);
}

struct Subscription {
    context: SubscriptionContext,
    destination: Destination,
    sink_id: u64,
    state: SubscriptionState,
    credit: u32,
    in_flight: BTreeSet<u64>,
    backlog: VecDeque<Message>,
    dropped: u64,
}

impl Subscription {
    fn deliverable(&self) -> bool {
        self.state == SubscriptionState::Active && self.credit > 0 && !self.backlog.is_empty()
    }

    fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus {
            alias: self.context.alias.clone(),
            destination: self.destination.name().to_string(),
            state: self.state,
            credit: self.credit,
            in_flight: self.in_flight.len(),
            pending: self.backlog.len(),
            dropped: self.dropped,
        }
    }
}

#[derive(Default)]
struct ControllerState {
    owner: Option<Weak<dyn DeliveryTarget>>,
    subscriptions: BTreeMap<String, Subscription>,
    closed: bool,
}

impl ControllerState {
    fn live_owner(&self) -> Option<Arc<dyn DeliveryTarget>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub alias: String,
    pub destination: String,
    pub state: SubscriptionState,
    pub credit: u32,
    pub in_flight: usize,
    pub pending: usize,
    /// Buffered messages discarded because the backlog was full.
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub session_id: String,
    pub unique_id: String,
    pub persistent: bool,
    pub hibernating: bool,
    pub subscriptions: Vec<SubscriptionStatus>,
}

/// Subscription set for one session identity.
pub struct SubscriptionController {
    session_id: String,
    unique_id: String,
    persistent: bool,
    destinations: Arc<dyn DestinationFactory>,
    state: Mutex<ControllerState>,
    timeout: Mutex<Option<ScheduledTask>>,
    parked: AtomicBool,
    backlog_limit: AtomicUsize,
    self_ref: Weak<SubscriptionController>,
}

impl SubscriptionController {
    pub fn new(
        session_id: impl Into<String>,
        unique_id: impl Into<String>,
        persistent: bool,
        destinations: Arc<dyn DestinationFactory>,
    ) -> Arc<Self> {
        let session_id = session_id.into();
        let unique_id = unique_id.into();
        Arc::new_cyclic(|self_ref| Self {
            session_id,
            unique_id,
            persistent,
            destinations,
            state: Mutex::new(ControllerState::default()),
            timeout: Mutex::new(None),
            parked: AtomicBool::new(false),
            backlog_limit: AtomicUsize::new(DEFAULT_BACKLOG_LIMIT),
            self_ref: self_ref.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Cap the per-subscription backlog; the oldest message goes first.
    pub fn set_backlog_limit(&self, limit: usize) {
        self.backlog_limit.store(limit.max(1), Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// No live session is attached.
    pub fn is_hibernating(&self) -> bool {
        self.state.lock().live_owner().is_none()
    }

    pub fn len(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.state.lock().subscriptions.contains_key(alias)
    }

    pub fn state_of(&self, alias: &str) -> Option<SubscriptionState> {
        self.state.lock().subscriptions.get(alias).map(|s| s.state)
    }

    /// Snapshot of the persisted form of every subscription, ordered by alias.
    pub fn contexts(&self) -> Vec<SubscriptionContext> {
        self.state
            .lock()
            .subscriptions
            .values()
            .map(|s| s.context.clone())
            .collect()
    }

    pub fn info(&self) -> SubscriptionInfo {
        let state = self.state.lock();
        SubscriptionInfo {
            session_id: self.session_id.clone(),
            unique_id: self.unique_id.clone(),
            persistent: self.persistent,
            hibernating: state.live_owner().is_none(),
            subscriptions: state.subscriptions.values().map(Subscription::status).collect(),
        }
    }

    /// Rebuild subscriptions from persisted contexts without replaying retained messages.
    pub async fn restore(&self, contexts: Vec<SubscriptionContext>) {
        let total = contexts.len();
        for (idx, context) in contexts.into_iter().enumerate() {
            let alias = context.alias.clone();
            match self.register(context, true).await {
                Ok(_) => debug!(
                    session_id = %self.session_id,
                    alias = %alias,
                    "restored subscription {}/{}",
                    idx + 1,
                    total
                ),
                Err(err) => warn!(
                    session_id = %self.session_id,
                    alias = %alias,
                    "failed to restore subscription: {err}"
                ),
            }
        }
    }

    /// Register (or replace) a subscription. The destination is found or created first.
    pub async fn add_subscription(
        &self,
        context: SubscriptionContext,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        self.register(context, false).await
    }

    async fn register(
        &self,
        context: SubscriptionContext,
        reload: bool,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        if self.is_closed() {
            return Err(SubscriptionError::ControllerClosed(self.session_id.clone()));
        }
        // An existing subscription under this alias stays in place until the
        // new destination is resolved.
        let destination = self
            .destinations
            .find_or_create(&context.destination_name, context.destination_type)
            .await?;
        let sink = Arc::new(SubscriptionSink {
            id: SINK_IDS.fetch_add(1, Ordering::Relaxed),
            alias: context.alias.clone(),
            share_group: context.shared_name.clone(),
            controller: self.self_ref.clone(),
        });
        let replaced = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SubscriptionError::ControllerClosed(self.session_id.clone()));
            }
            let sub_state = if state.live_owner().is_some() {
                SubscriptionState::Active
            } else {
                SubscriptionState::Hibernated
            };
            state.subscriptions.insert(
                context.alias.clone(),
                Subscription {
                    credit: context.initial_credit(),
                    context: context.clone(),
                    destination: destination.clone(),
                    sink_id: sink.id,
                    state: sub_state,
                    in_flight: BTreeSet::new(),
                    backlog: VecDeque::new(),
                    dropped: 0,
                },
            )
        };
        if let Some(old) = &replaced {
            old.destination.store().detach(old.sink_id);
        }
        let send_retained = !reload
            && match context.retain_handler {
                RetainHandler::SendAlways => true,
                RetainHandler::SendIfNew => replaced.is_none(),
                RetainHandler::DoNotSend => false,
            };
        destination.store().attach(sink.clone(), &context, send_retained);
        info!(
            session_id = %self.session_id,
            alias = %context.alias,
            destination = %destination.name(),
            replaced = replaced.is_some(),
            "subscription registered"
        );
        self.pump(&context.alias);
        Ok(SubscriptionHandle {
            alias: context.alias,
            destination,
            controller: self.self_ref.clone(),
        })
    }

    fn detach(&self, alias: &str) -> Option<Subscription> {
        let removed = self.state.lock().subscriptions.remove(alias);
        if let Some(sub) = &removed {
            sub.destination.store().detach(sub.sink_id);
        }
        removed
    }

    pub fn remove_subscription(&self, alias: &str) -> bool {
        let removed = self.detach(alias).is_some();
        if removed {
            debug!(session_id = %self.session_id, alias = %alias, "subscription removed");
        }
        removed
    }

    /// Pause delivery for one subscription, keeping its state.
    pub fn hibernate_subscription(&self, alias: &str) -> bool {
        let mut state = self.state.lock();
        match state.subscriptions.get_mut(alias) {
            Some(sub) => {
                sub.state = SubscriptionState::Hibernated;
                true
            }
            None => false,
        }
    }

    /// Detach from the live session and pause every subscription.
    pub fn hibernate_all(&self) {
        let mut state = self.state.lock();
        state.owner = None;
        for sub in state.subscriptions.values_mut() {
            sub.state = SubscriptionState::Hibernated;
        }
        debug!(session_id = %self.session_id, "subscription controller hibernated");
    }

    /// Attach a live session; subscriptions keep their individual state.
    /// The expiry timer is left to the session manager. No-op once closed.
    pub fn wake(&self, owner: Weak<dyn DeliveryTarget>) {
        let mut state = self.state.lock();
        if !state.closed {
            state.owner = Some(owner);
        }
    }

    /// Attach a live session and mark every subscription active. Buffered
    /// messages go out on the next [`SubscriptionController::flush`].
    pub fn wake_all(&self, owner: Weak<dyn DeliveryTarget>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.owner = Some(owner);
        for sub in state.subscriptions.values_mut() {
            sub.state = SubscriptionState::Active;
        }
    }

    /// Attach a live session and mark the subscriptions bound to
    /// `destination` active. Returns a handle to the first of them.
    pub fn wake_destination(
        &self,
        owner: Weak<dyn DeliveryTarget>,
        destination: &str,
    ) -> Option<SubscriptionHandle> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.owner = Some(owner);
        let mut first = None;
        for sub in state
            .subscriptions
            .values_mut()
            .filter(|sub| sub.destination.name() == destination)
        {
            sub.state = SubscriptionState::Active;
            first.get_or_insert_with(|| (sub.context.alias.clone(), sub.destination.clone()));
        }
        first.map(|(alias, destination)| SubscriptionHandle {
            alias,
            destination,
            controller: self.self_ref.clone(),
        })
    }

    /// Retry delivery of buffered messages on every active subscription.
    pub fn flush(&self) {
        let aliases: Vec<String> = {
            let state = self.state.lock();
            state
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.state == SubscriptionState::Active)
                .map(|(alias, _)| alias.clone())
                .collect()
        };
        for alias in aliases {
            self.pump(&alias);
        }
    }

    /// Add client-managed credit to a subscription.
    pub fn grant_credit(&self, alias: &str, credit: u32) -> Result<(), SubscriptionError> {
        {
            let mut state = self.state.lock();
            let sub = state
                .subscriptions
                .get_mut(alias)
                .ok_or_else(|| SubscriptionError::UnknownSubscription(alias.to_string()))?;
            sub.credit = sub.credit.saturating_add(credit);
        }
        self.pump(alias);
        Ok(())
    }

    /// Release every subscription and cancel the expiry timer. Idempotent.
    pub fn close(&self) {
        let subscriptions = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.owner = None;
            std::mem::take(&mut state.subscriptions)
        };
        if let Some(timeout) = self.timeout.lock().take() {
            timeout.cancel();
        }
        for sub in subscriptions.values() {
            sub.destination.store().detach(sub.sink_id);
        }
        info!(
            session_id = %self.session_id,
            released = subscriptions.len(),
            "subscription controller closed"
        );
    }

    /// Install the hibernation expiry timer, cancelling any previous one.
    pub fn set_timeout(&self, task: ScheduledTask) {
        if let Some(previous) = self.timeout.lock().replace(task) {
            previous.cancel();
        }
    }

    pub fn take_timeout(&self) -> Option<ScheduledTask> {
        self.timeout.lock().take()
    }

    pub fn has_timeout(&self) -> bool {
        self.timeout.lock().is_some()
    }

    /// Mark the controller as counted among disconnected sessions.
    /// Returns `false` if it already was.
    pub(crate) fn park(&self) -> bool {
        !self.parked.swap(true, Ordering::AcqRel)
    }

    /// Clear the disconnected mark. Returns whether it was set.
    pub(crate) fn unpark(&self) -> bool {
        self.parked.swap(false, Ordering::AcqRel)
    }

    fn dispatch(&self, alias: &str, sink_id: u64, message: Message) {
        let limit = self.backlog_limit.load(Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let Some(sub) = state.subscriptions.get_mut(alias) else {
                return;
            };
            if sub.sink_id != sink_id {
                return;
            }
            while sub.backlog.len() >= limit {
                let Some(oldest) = sub.backlog.pop_front() else {
                    break;
                };
                sub.dropped += 1;
                debug!(
                    session_id = %self.session_id,
                    alias = %alias,
                    message_id = oldest.id,
                    "backlog full, dropped oldest message"
                );
            }
            sub.backlog.push_back(message);
        }
        self.pump(alias);
    }

    /// Deliver from the backlog while the subscription is active, has credit
    /// and the owner accepts. Bounded by the backlog length on entry.
    fn pump(&self, alias: &str) {
        let mut budget = {
            let state = self.state.lock();
            match state.subscriptions.get(alias) {
                Some(sub) => sub.backlog.len(),
                None => return,
            }
        };
        while budget > 0 {
            budget -= 1;
            let (target, destination, sink_id, message) = {
                let mut state = self.state.lock();
                let Some(target) = state.live_owner() else {
                    return;
                };
                if !target.is_ready() {
                    return;
                }
                let Some(sub) = state.subscriptions.get_mut(alias) else {
                    return;
                };
                if !sub.deliverable() {
                    return;
                }
                let Some(message) = sub.backlog.pop_front() else {
                    return;
                };
                sub.credit -= 1;
                sub.in_flight.insert(message.id);
                (target, sub.destination.name().to_string(), sub.sink_id, message)
            };
            let completion = Completion {
                controller: self.self_ref.clone(),
                alias: alias.to_string(),
                sink_id,
                message: Some(message.clone()),
            };
            target.deliver(alias, &destination, message, completion);
        }
    }

    fn settle(&self, alias: &str, sink_id: u64, message: Message, delivered: bool) {
        let destination = {
            let mut state = self.state.lock();
            let Some(sub) = state.subscriptions.get_mut(alias) else {
                return;
            };
            if sub.sink_id != sink_id || !sub.in_flight.remove(&message.id) {
                return;
            }
            if delivered {
                if sub.context.credit_mode == CreditMode::Server {
                    let max = sub.context.receive_maximum.unwrap_or(DEFAULT_RECEIVE_MAXIMUM);
                    sub.credit = (sub.credit + 1).min(max);
                }
                Some(sub.destination.clone())
            } else {
                sub.credit = sub.credit.saturating_add(1);
                sub.backlog.push_front(message.clone());
                None
            }
        };
        if let Some(destination) = destination {
            destination.store().acknowledge(sink_id, message.id);
            self.pump(alias);
        }
    }
}

impl std::fmt::Debug for SubscriptionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionController")
            .field("session_id", &self.session_id)
            .field("persistent", &self.persistent)
            .finish()
    }
}

/// One-shot delivery completion handed to the protocol adapter.
///
/// `complete` finishes ack/credit bookkeeping. Dropping it without completing
/// returns the message to the head of the subscription backlog.
pub struct Completion {
    controller: Weak<SubscriptionController>,
    alias: String,
    sink_id: u64,
    message: Option<Message>,
}

impl Completion {
    pub fn message_id(&self) -> u64 {
        self.message.as_ref().map(|m| m.id).unwrap_or_default()
    }

    pub fn complete(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, delivered: bool) {
        let Some(message) = self.message.take() else {
            return;
        };
        if let Some(controller) = self.controller.upgrade() {
            controller.settle(&self.alias, self.sink_id, message, delivered);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("alias", &self.alias)
            .field("message_id", &self.message_id())
            .finish()
    }
}

/// Caller handle for one registered subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    alias: String,
    destination: Destination,
    controller: Weak<SubscriptionController>,
}

impl SubscriptionHandle {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn grant_credit(&self, credit: u32) -> Result<(), SubscriptionError> {
        match self.controller.upgrade() {
            Some(controller) => controller.grant_credit(&self.alias, credit),
            None => Err(SubscriptionError::UnknownSubscription(self.alias.clone())),
        }
    }

    pub fn status(&self) -> Option<SubscriptionStatus> {
        let controller = self.controller.upgrade()?;
        let state = controller.state.lock();
        state.subscriptions.get(&self.alias).map(Subscription::status)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("alias", &self.alias)
            .field("destination", &self.destination.name())
            .finish()
    }
}

struct SubscriptionSink {
    id: u64,
    alias: String,
    share_group: Option<String>,
    controller: Weak<SubscriptionController>,
}

impl MessageSink for SubscriptionSink {
    fn id(&self) -> u64 {
        self.id
    }

    fn share_group(&self) -> Option<&str> {
        self.share_group.as_deref()
    }

    fn offer(&self, _destination: &str, message: Message) {
        if let Some(controller) = self.controller.upgrade() {
            controller.dispatch(&self.alias, self.id, message);
        }
    }
}
