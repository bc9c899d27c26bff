//! Last-will messages published on behalf of disconnected clients.

use crate::core::time::{ScheduledTask, TaskScheduler};
use crate::messaging::destination::{DestinationFactory, DestinationType, Message, Qos};
use crate::storage::WillStore;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Persisted will of one session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillDetails {
    pub session_id: String,
    /// Fully-qualified destination name.
    pub destination: String,
    pub payload: Bytes,
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub delay_secs: u64,
}

impl WillDetails {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn to_message(&self) -> Message {
        Message::new(self.payload.clone(), self.qos, self.retain)
    }
}

/// One pending will. Fires at most once, either from its delay timer or
/// from a forced [`WillTask::run`].
pub struct WillTask {
    details: WillDetails,
    done: AtomicBool,
    timer: Mutex<Option<ScheduledTask>>,
    registry: Weak<WillTaskRegistry>,
}

impl WillTask {
    pub fn details(&self) -> &WillDetails {
        &self.details
    }

    pub fn session_id(&self) -> &str {
        &self.details.session_id
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Arm the delay timer. A zero delay fires straight away.
    pub fn schedule(self: &Arc<Self>) {
        if self.is_done() {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if self.details.delay_secs == 0 {
            self.run();
            return;
        }
        let task = Arc::downgrade(self);
        let timer = registry.scheduler.schedule(self.details.delay(), move || {
            if let Some(task) = task.upgrade() {
                task.run();
            }
        });
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.cancel();
        }
        debug!(
            session_id = %self.details.session_id,
            delay_secs = self.details.delay_secs,
            "will scheduled"
        );
    }

    /// Stop the delay timer without marking the will done.
    pub fn cancel(&self) -> bool {
        match self.timer.lock().take() {
            Some(timer) => timer.cancel(),
            None => false,
        }
    }

    /// Publish now. Returns `false` if the will already fired or was discarded.
    pub fn run(self: &Arc<Self>) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel();
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        registry.release(self);
        registry.fired.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %self.details.session_id,
            destination = %self.details.destination,
            "will fired"
        );
        let destinations = registry.destinations.clone();
        let details = self.details.clone();
        registry.scheduler.spawn(async move {
            let published = match destinations
                .find_or_create(&details.destination, DestinationType::Topic)
                .await
            {
                Ok(destination) => destination.publish(details.to_message()),
                Err(err) => Err(err),
            };
            if let Err(err) = published {
                warn!(
                    session_id = %details.session_id,
                    destination = %details.destination,
                    "will publish failed: {err}"
                );
            }
        });
        true
    }

    /// Drop the will without publishing.
    pub fn discard(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.cancel();
            debug!(session_id = %self.details.session_id, "will discarded");
        }
    }
}

impl std::fmt::Debug for WillTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WillTask")
            .field("session_id", &self.details.session_id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// At most one pending will per session identity, mirrored into a [`WillStore`].
pub struct WillTaskRegistry {
    destinations: Arc<dyn DestinationFactory>,
    store: WillStore,
    scheduler: TaskScheduler,
    tasks: Mutex<HashMap<String, Arc<WillTask>>>,
    fired: AtomicU64,
    self_ref: Weak<WillTaskRegistry>,
}

impl WillTaskRegistry {
    pub fn new(
        destinations: Arc<dyn DestinationFactory>,
        store: WillStore,
        scheduler: TaskScheduler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            destinations,
            store,
            scheduler,
            tasks: Mutex::new(HashMap::new()),
            fired: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    /// Reload persisted wills and schedule each of them.
    pub fn start(&self) -> usize {
        let persisted = match self.store.load_all() {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!("unable to reload wills: {err}");
                return 0;
            }
        };
        let mut loaded = 0;
        for details in persisted {
            let task = self.insert(details);
            task.schedule();
            loaded += 1;
        }
        if loaded > 0 {
            info!(count = loaded, "reloaded pending wills");
        }
        loaded
    }

    /// Cancel every delay timer. Pending wills stay persisted.
    pub fn stop(&self) {
        let tasks: Vec<Arc<WillTask>> = self.tasks.lock().values().cloned().collect();
        for task in tasks {
            task.cancel();
        }
    }

    /// Install `details` as the will of its session, discarding any previous one.
    pub fn replace(&self, details: WillDetails) -> Arc<WillTask> {
        // persisted under the task map lock so `forget` cannot drop the new record
        let mut tasks = self.tasks.lock();
        if let Err(err) = self.store.put(&details) {
            warn!(session_id = %details.session_id, "unable to persist will: {err}");
        }
        self.insert_locked(&mut tasks, details)
    }

    fn insert(&self, details: WillDetails) -> Arc<WillTask> {
        let mut tasks = self.tasks.lock();
        self.insert_locked(&mut tasks, details)
    }

    fn insert_locked(
        &self,
        tasks: &mut HashMap<String, Arc<WillTask>>,
        details: WillDetails,
    ) -> Arc<WillTask> {
        let task = Arc::new(WillTask {
            details,
            done: AtomicBool::new(false),
            timer: Mutex::new(None),
            registry: self.self_ref.clone(),
        });
        let previous = tasks.insert(task.details.session_id.clone(), task.clone());
        if let Some(previous) = previous {
            previous.discard();
        }
        task
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<WillTask>> {
        self.tasks.lock().get(session_id).cloned()
    }

    /// Remove the will of `session_id` without touching its timer.
    pub fn remove(&self, session_id: &str) -> Option<Arc<WillTask>> {
        let removed = self.tasks.lock().remove(session_id);
        if removed.is_some() {
            if let Err(err) = self.store.remove(session_id) {
                warn!(session_id = %session_id, "unable to remove persisted will: {err}");
            }
        }
        removed
    }

    /// Remove the will of `session_id` from memory only. The persisted
    /// record stays until [`WillTaskRegistry::forget`].
    pub fn take(&self, session_id: &str) -> Option<Arc<WillTask>> {
        self.tasks.lock().remove(session_id)
    }

    /// Drop the persisted will of `session_id` unless a newer will has been
    /// installed since it was taken.
    pub fn forget(&self, session_id: &str) {
        let tasks = self.tasks.lock();
        if tasks.contains_key(session_id) {
            return;
        }
        if let Err(err) = self.store.remove(session_id) {
            warn!(session_id = %session_id, "unable to remove persisted will: {err}");
        }
    }

    fn release(&self, task: &Arc<WillTask>) {
        let owned = {
            let mut tasks = self.tasks.lock();
            match tasks.get(task.session_id()) {
                Some(current) if Arc::ptr_eq(current, task) => {
                    tasks.remove(task.session_id());
                    true
                }
                _ => false,
            }
        };
        if owned {
            if let Err(err) = self.store.remove(task.session_id()) {
                warn!(session_id = %task.session_id(), "unable to remove persisted will: {err}");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wills published since the registry was created.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}
