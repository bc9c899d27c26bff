use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Clock abstraction to enforce deterministic time sourcing in core paths.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;
}

pub type SharedClock = Arc<dyn Clock>;

/// Runtime-backed clock; follows tokio's clock so paused test time applies.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

#[derive(Debug, Error)]
#[error("no tokio runtime available for the task scheduler")]
pub struct NoRuntime;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a delayed or periodic task.
///
/// The task state is an explicit flag rather than whatever the runtime
/// reports for the join handle: a one-shot task moves `pending -> fired`
/// right before its body runs, and `cancel` only succeeds while the task
/// is still pending. Exactly one of the two transitions wins.
#[derive(Debug)]
pub struct ScheduledTask {
    state: Arc<AtomicU8>,
    abort: AbortHandle,
}

impl ScheduledTask {
    /// Cancel the task. Returns `false` when the task already fired.
    pub fn cancel(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.abort.abort();
                true
            }
            Err(current) => current == CANCELLED,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// Spawns timers on a captured tokio runtime.
#[derive(Clone)]
pub struct TaskScheduler {
    handle: Handle,
    clock: SharedClock,
}

impl TaskScheduler {
    pub fn new(handle: Handle, clock: SharedClock) -> Self {
        Self { handle, clock }
    }

    /// Bind to the runtime of the calling task.
    pub fn current() -> Result<Self, NoRuntime> {
        let handle = Handle::try_current().map_err(|_| NoRuntime)?;
        Ok(Self::new(handle, Arc::new(SystemClock)))
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }

    /// Run `task` once after `delay` unless cancelled first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let task_state = state.clone();
        let clock = self.clock.clone();
        let join = self.handle.spawn(async move {
            clock.sleep(delay).await;
            if task_state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                task();
            }
        });
        ScheduledTask {
            state,
            abort: join.abort_handle(),
        }
    }

    /// Run `task` every `period`, first run after one period.
    pub fn schedule_at_fixed_rate<F>(&self, period: Duration, task: F) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let task_state = state.clone();
        let clock = self.clock.clone();
        let join = self.handle.spawn(async move {
            loop {
                clock.sleep(period).await;
                if task_state.load(Ordering::Acquire) != PENDING {
                    break;
                }
                task();
            }
        });
        ScheduledTask {
            state,
            abort: join.abort_handle(),
        }
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_and_refuses_late_cancel() {
        let scheduler = TaskScheduler::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = scheduler.schedule(Duration::from_secs(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(task.has_fired());
        assert!(!task.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_runs() {
        let scheduler = TaskScheduler::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = scheduler.schedule(Duration::from_secs(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.cancel());
        assert!(task.cancel());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_stops_after_cancel() {
        let scheduler = TaskScheduler::current().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = scheduler.schedule_at_fixed_rate(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        task.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
