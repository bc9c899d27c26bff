//! Destination contracts consumed by the session engine.
//!
//! The destination/storage engine itself lives outside this crate; sessions,
//! subscriptions, transactions and wills only talk to it through
//! [`DestinationFactory`], [`DestinationStore`] and [`MessageSink`].

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::subscriptions::SubscriptionContext;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DestinationError {
    #[error("destination not found: {0}")]
    NotFound(String),
    #[error("destination {name} exists as {existing:?}, requested {requested:?}")]
    TypeMismatch {
        name: String,
        existing: DestinationType,
        requested: DestinationType,
    },
    #[error("destination {0} does not accept publishes")]
    ReadOnly(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("destination {0} has been deleted")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Requested destination type, used by find-or-create calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    Topic,
    Queue,
    TemporaryTopic,
    TemporaryQueue,
    Schema,
    Metrics,
}

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::Topic => "topic",
            DestinationType::Queue => "queue",
            DestinationType::TemporaryTopic => "temporary_topic",
            DestinationType::TemporaryQueue => "temporary_queue",
            DestinationType::Schema => "schema",
            DestinationType::Metrics => "metrics",
        }
    }
}

/// The closed set of destination kinds the engine knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKind {
    Topic,
    Queue,
    Temporary { queue: bool },
    /// Schema destinations store their messages directly; they never take part in transactions.
    Schema { schema_id: String },
    /// Broker generated statistics; read-only for clients.
    Metrics,
}

impl DestinationKind {
    pub fn for_type(kind: DestinationType, name: &str) -> Self {
        match kind {
            DestinationType::Topic => DestinationKind::Topic,
            DestinationType::Queue => DestinationKind::Queue,
            DestinationType::TemporaryTopic => DestinationKind::Temporary { queue: false },
            DestinationType::TemporaryQueue => DestinationKind::Temporary { queue: true },
            DestinationType::Schema => DestinationKind::Schema {
                schema_id: name.to_string(),
            },
            DestinationType::Metrics => DestinationKind::Metrics,
        }
    }

    pub fn destination_type(&self) -> DestinationType {
        match self {
            DestinationKind::Topic => DestinationType::Topic,
            DestinationKind::Queue => DestinationType::Queue,
            DestinationKind::Temporary { queue: false } => DestinationType::TemporaryTopic,
            DestinationKind::Temporary { queue: true } => DestinationType::TemporaryQueue,
            DestinationKind::Schema { .. } => DestinationType::Schema,
            DestinationKind::Metrics => DestinationType::Metrics,
        }
    }

    /// Queue semantics: each message goes to a single subscriber.
    pub fn is_queue(&self) -> bool {
        matches!(
            self,
            DestinationKind::Queue | DestinationKind::Temporary { queue: true }
        )
    }
}

/// Broker-native message. The payload format is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned identifier; zero until stored.
    #[serde(default)]
    pub id: u64,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, qos: Qos, retain: bool) -> Self {
        Self {
            id: 0,
            payload: payload.into(),
            qos,
            retain,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Receiver side of a subscription as seen by the destination engine.
pub trait MessageSink: Send + Sync {
    fn id(&self) -> u64;
    /// Shared-subscription group this sink belongs to, if any.
    fn share_group(&self) -> Option<&str> {
        None
    }
    fn offer(&self, destination: &str, message: Message);
}

/// Storage operations of one destination.
pub trait DestinationStore: Send + Sync {
    /// Store and publish immediately. Returns the assigned message id.
    fn store_message(&self, message: Message) -> Result<u64, DestinationError>;
    /// Stage a message under a transaction; invisible until [`DestinationStore::commit`].
    fn store_transactional(&self, txn: u64, message: Message) -> Result<(), DestinationError>;
    fn commit(&self, txn: u64) -> Result<(), DestinationError>;
    fn abort(&self, txn: u64) -> Result<(), DestinationError>;
    /// Register a subscription sink, optionally replaying the retained message to it.
    fn attach(&self, sink: Arc<dyn MessageSink>, context: &SubscriptionContext, send_retained: bool);
    fn detach(&self, sink_id: u64);
    /// Acknowledge a delivered message for a sink.
    fn acknowledge(&self, _sink_id: u64, _message_id: u64) {}
}

/// Handle to a resolved destination.
#[derive(Clone)]
pub struct Destination {
    name: Arc<str>,
    kind: DestinationKind,
    store: Arc<dyn DestinationStore>,
}

impl Destination {
    pub fn new(name: impl Into<Arc<str>>, kind: DestinationKind, store: Arc<dyn DestinationStore>) -> Self {
        Self {
            name: name.into(),
            kind,
            store,
        }
    }

    /// Fully-qualified (tenant mapped) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &DestinationKind {
        &self.kind
    }

    pub fn store(&self) -> &Arc<dyn DestinationStore> {
        &self.store
    }

    /// Publish outside any transaction.
    pub fn publish(&self, message: Message) -> Result<u64, DestinationError> {
        match &self.kind {
            DestinationKind::Metrics => Err(DestinationError::ReadOnly(self.name.to_string())),
            DestinationKind::Topic
            | DestinationKind::Queue
            | DestinationKind::Temporary { .. }
            | DestinationKind::Schema { .. } => self.store.store_message(message),
        }
    }

    pub fn same_as(&self, other: &Destination) -> bool {
        self.name == other.name
            && std::ptr::eq(
                Arc::as_ptr(&self.store).cast::<()>(),
                Arc::as_ptr(&other.store).cast::<()>(),
            )
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Asynchronous lookup and lifecycle of destinations, keyed by fully-qualified name.
pub trait DestinationFactory: Send + Sync {
    fn find<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Destination>, DestinationError>>;

    fn find_or_create<'a>(
        &'a self,
        name: &'a str,
        kind: DestinationType,
    ) -> BoxFuture<'a, Result<Destination, DestinationError>>;

    fn create<'a>(
        &'a self,
        name: &'a str,
        kind: DestinationType,
    ) -> BoxFuture<'a, Result<Destination, DestinationError>>;

    fn delete<'a>(&'a self, destination: &'a Destination) -> BoxFuture<'a, Result<(), DestinationError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_type() {
        for kind in [
            DestinationType::Topic,
            DestinationType::Queue,
            DestinationType::TemporaryTopic,
            DestinationType::TemporaryQueue,
            DestinationType::Schema,
            DestinationType::Metrics,
        ] {
            assert_eq!(DestinationKind::for_type(kind, "x").destination_type(), kind);
        }
    }

    #[test]
    fn queue_semantics_cover_temporary_queues() {
        assert!(DestinationKind::Queue.is_queue());
        assert!(DestinationKind::Temporary { queue: true }.is_queue());
        assert!(!DestinationKind::Temporary { queue: false }.is_queue());
        assert!(!DestinationKind::Topic.is_queue());
    }

    #[test]
    fn qos_codes() {
        assert_eq!(Qos::from_u8(1), Some(Qos::AtLeastOnce));
        assert_eq!(Qos::from_u8(3), None);
        assert_eq!(Qos::ExactlyOnce.as_u8(), 2);
    }
}
