//! In-process destination engine.
//!
//! Keeps a committed log, per-transaction staging and one retained message per
//! destination. Used by the binary when no external engine is wired in and by
//! the test suites.

use crate::messaging::destination::{
    Destination, DestinationError, DestinationFactory, DestinationKind, DestinationStore,
    DestinationType, Message, MessageSink,
};
use crate::messaging::subscriptions::SubscriptionContext;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const QUEUE_GROUP: &str = "";

/// Round-robin cursor per share group.
#[derive(Debug, Default)]
struct ShareGroupBalancer {
    next: HashMap<String, usize>,
}

impl ShareGroupBalancer {
    fn pick(&mut self, group: &str, members: &[usize]) -> Option<usize> {
        if members.is_empty() {
            return None;
        }
        let cursor = self.next.entry(group.to_string()).or_insert(0);
        let idx = *cursor % members.len();
        *cursor = (*cursor + 1) % members.len();
        Some(members[idx])
    }
}

#[derive(Default)]
struct StoreState {
    next_id: u64,
    log: Vec<Message>,
    staged: HashMap<u64, Vec<Message>>,
    retained: Option<Message>,
    sinks: Vec<Arc<dyn MessageSink>>,
    balancer: ShareGroupBalancer,
    acknowledged: Vec<(u64, u64)>,
    deleted: bool,
}

impl StoreState {
    fn recipients(&mut self, queue: bool) -> Vec<Arc<dyn MessageSink>> {
        if queue {
            let all: Vec<usize> = (0..self.sinks.len()).collect();
            return self
                .balancer
                .pick(QUEUE_GROUP, &all)
                .map(|idx| vec![self.sinks[idx].clone()])
                .unwrap_or_default();
        }
        let mut out = Vec::new();
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, sink) in self.sinks.iter().enumerate() {
            match sink.share_group() {
                None => out.push(sink.clone()),
                Some(group) => match groups.iter_mut().find(|(name, _)| name == group) {
                    Some((_, members)) => members.push(idx),
                    None => groups.push((group.to_string(), vec![idx])),
                },
            }
        }
        for (group, members) in groups {
            if let Some(idx) = self.balancer.pick(&group, &members) {
                out.push(self.sinks[idx].clone());
            }
        }
        out
    }
}

/// Storage of one in-memory destination.
pub struct MemoryDestinationStore {
    name: String,
    kind: DestinationKind,
    state: Mutex<StoreState>,
}

impl MemoryDestinationStore {
    fn new(name: &str, kind: DestinationKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn committed(&self) -> Vec<Message> {
        self.state.lock().log.clone()
    }

    pub fn retained(&self) -> Option<Message> {
        self.state.lock().retained.clone()
    }

    pub fn staged(&self, txn: u64) -> usize {
        self.state.lock().staged.get(&txn).map(Vec::len).unwrap_or(0)
    }

    pub fn subscribers(&self) -> usize {
        self.state.lock().sinks.len()
    }

    pub fn acknowledged(&self) -> Vec<(u64, u64)> {
        self.state.lock().acknowledged.clone()
    }

    fn mark_deleted(&self) {
        let mut state = self.state.lock();
        state.deleted = true;
        state.sinks.clear();
        state.staged.clear();
    }
}

impl DestinationStore for MemoryDestinationStore {
    fn store_message(&self, mut message: Message) -> Result<u64, DestinationError> {
        let (id, recipients) = {
            let mut state = self.state.lock();
            if state.deleted {
                return Err(DestinationError::Closed(self.name.clone()));
            }
            state.next_id += 1;
            message.id = state.next_id;
            if message.retain {
                state.retained = if message.payload.is_empty() {
                    None
                } else {
                    Some(message.clone())
                };
            }
            state.log.push(message.clone());
            (message.id, state.recipients(self.kind.is_queue()))
        };
        for sink in recipients {
            sink.offer(&self.name, message.clone());
        }
        Ok(id)
    }

    fn store_transactional(&self, txn: u64, message: Message) -> Result<(), DestinationError> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(DestinationError::Closed(self.name.clone()));
        }
        state.staged.entry(txn).or_default().push(message);
        Ok(())
    }

    fn commit(&self, txn: u64) -> Result<(), DestinationError> {
        let staged = self.state.lock().staged.remove(&txn).unwrap_or_default();
        debug!(destination = %self.name, txn, staged = staged.len(), "committing staged messages");
        for message in staged {
            self.store_message(message)?;
        }
        Ok(())
    }

    fn abort(&self, txn: u64) -> Result<(), DestinationError> {
        self.state.lock().staged.remove(&txn);
        Ok(())
    }

    fn attach(&self, sink: Arc<dyn MessageSink>, _context: &SubscriptionContext, send_retained: bool) {
        let retained = {
            let mut state = self.state.lock();
            if state.deleted {
                return;
            }
            state.sinks.retain(|existing| existing.id() != sink.id());
            state.sinks.push(sink.clone());
            if send_retained {
                state.retained.clone()
            } else {
                None
            }
        };
        if let Some(message) = retained {
            sink.offer(&self.name, message);
        }
    }

    fn detach(&self, sink_id: u64) {
        self.state.lock().sinks.retain(|sink| sink.id() != sink_id);
    }

    fn acknowledge(&self, sink_id: u64, message_id: u64) {
        self.state.lock().acknowledged.push((sink_id, message_id));
    }
}

/// [`DestinationFactory`] backed by [`MemoryDestinationStore`]s.
#[derive(Default)]
pub struct MemoryDestinationFactory {
    stores: Mutex<HashMap<String, Arc<MemoryDestinationStore>>>,
}

impl MemoryDestinationFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn store(&self, name: &str) -> Option<Arc<MemoryDestinationStore>> {
        self.stores.lock().get(name).cloned()
    }

    /// Committed messages of `name`; empty when the destination does not exist.
    pub fn committed(&self, name: &str) -> Vec<Message> {
        self.store(name).map(|s| s.committed()).unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn handle(name: &str, store: &Arc<MemoryDestinationStore>) -> Destination {
        Destination::new(name, store.kind.clone(), store.clone())
    }

    fn lookup(&self, name: &str) -> Option<Destination> {
        self.stores.lock().get(name).map(|store| Self::handle(name, store))
    }

    fn get_or_insert(&self, name: &str, kind: DestinationType) -> (Destination, DestinationType) {
        let mut stores = self.stores.lock();
        let store = stores.entry(name.to_string()).or_insert_with(|| {
            debug!(destination = %name, kind = kind.as_str(), "destination created");
            Arc::new(MemoryDestinationStore::new(
                name,
                DestinationKind::for_type(kind, name),
            ))
        });
        (Self::handle(name, store), store.kind.destination_type())
    }
}

impl DestinationFactory for MemoryDestinationFactory {
    fn find<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Destination>, DestinationError>> {
        Box::pin(async move { Ok(self.lookup(name)) })
    }

    fn find_or_create<'a>(
        &'a self,
        name: &'a str,
        kind: DestinationType,
    ) -> BoxFuture<'a, Result<Destination, DestinationError>> {
        Box::pin(async move { Ok(self.get_or_insert(name, kind).0) })
    }

    fn create<'a>(
        &'a self,
        name: &'a str,
        kind: DestinationType,
    ) -> BoxFuture<'a, Result<Destination, DestinationError>> {
        Box::pin(async move {
            let (destination, existing) = self.get_or_insert(name, kind);
            if existing != kind {
                return Err(DestinationError::TypeMismatch {
                    name: name.to_string(),
                    existing,
                    requested: kind,
                });
            }
            Ok(destination)
        })
    }

    fn delete<'a>(&'a self, destination: &'a Destination) -> BoxFuture<'a, Result<(), DestinationError>> {
        Box::pin(async move {
            let removed = self.stores.lock().remove(destination.name());
            match removed {
                Some(store) => {
                    store.mark_deleted();
                    debug!(destination = %destination.name(), "destination deleted");
                    Ok(())
                }
                None => Err(DestinationError::NotFound(destination.name().to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::destination::Qos;

    struct Recorder {
        id: u64,
        group: Option<String>,
        seen: Mutex<Vec<u64>>,
    }

    impl Recorder {
        fn new(id: u64, group: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                id,
                group: group.map(str::to_string),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().clone()
        }
    }

    impl MessageSink for Recorder {
        fn id(&self) -> u64 {
            self.id
        }

        fn share_group(&self) -> Option<&str> {
            self.group.as_deref()
        }

        fn offer(&self, _destination: &str, message: Message) {
            self.seen.lock().push(message.id);
        }
    }

    fn msg(body: &'static str) -> Message {
        Message::new(body.as_bytes(), Qos::AtLeastOnce, false)
    }

    #[tokio::test]
    async fn staged_messages_are_invisible_until_commit() {
        let factory = MemoryDestinationFactory::new();
        let dest = factory.find_or_create("orders", DestinationType::Topic).await.unwrap();
        let sink = Recorder::new(1, None);
        let ctx = SubscriptionContext::new("a", "orders");
        dest.store().attach(sink.clone(), &ctx, false);

        dest.store().store_transactional(7, msg("one")).unwrap();
        dest.store().store_transactional(7, msg("two")).unwrap();
        assert!(sink.seen().is_empty());
        assert!(factory.committed("orders").is_empty());

        dest.store().commit(7).unwrap();
        assert_eq!(sink.seen(), vec![1, 2]);

        dest.store().store_transactional(8, msg("three")).unwrap();
        dest.store().abort(8).unwrap();
        dest.store().commit(8).unwrap();
        assert_eq!(factory.committed("orders").len(), 2);
    }

    #[tokio::test]
    async fn share_group_members_take_turns() {
        let factory = MemoryDestinationFactory::new();
        let dest = factory.find_or_create("jobs", DestinationType::Topic).await.unwrap();
        let ctx = SubscriptionContext::new("s", "jobs");
        let a = Recorder::new(1, Some("workers"));
        let b = Recorder::new(2, Some("workers"));
        let plain = Recorder::new(3, None);
        dest.store().attach(a.clone(), &ctx, false);
        dest.store().attach(b.clone(), &ctx, false);
        dest.store().attach(plain.clone(), &ctx, false);
        for body in ["1", "2", "3", "4"] {
            dest.publish(msg(body)).unwrap();
        }
        assert_eq!(a.seen(), vec![1, 3]);
        assert_eq!(b.seen(), vec![2, 4]);
        assert_eq!(plain.seen().len(), 4);
    }

    #[tokio::test]
    async fn retained_message_replayed_on_request() {
        let factory = MemoryDestinationFactory::new();
        let dest = factory.find_or_create("status", DestinationType::Topic).await.unwrap();
        dest.publish(Message::new("up".as_bytes(), Qos::AtMostOnce, true)).unwrap();
        let ctx = SubscriptionContext::new("s", "status");
        let late = Recorder::new(1, None);
        dest.store().attach(late.clone(), &ctx, true);
        assert_eq!(late.seen(), vec![1]);
        let quiet = Recorder::new(2, None);
        dest.store().attach(quiet.clone(), &ctx, false);
        assert!(quiet.seen().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_type_mismatch_and_delete_closes() {
        let factory = MemoryDestinationFactory::new();
        let dest = factory.create("q", DestinationType::Queue).await.unwrap();
        let err = factory.create("q", DestinationType::Topic).await.unwrap_err();
        assert!(matches!(err, DestinationError::TypeMismatch { .. }));
        factory.delete(&dest).await.unwrap();
        assert!(factory.find("q").await.unwrap().is_none());
        assert!(matches!(dest.publish(msg("x")), Err(DestinationError::Closed(_))));
    }
}
