use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{Clock, ManualClock};

/// Stand-in deadline for delays that overflow the monotonic clock
const FAR_FUTURE: StdDuration = StdDuration::from_secs(86_400 * 365 * 30);

/// Deferred unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Schedules one-shot tasks after a delay.
///
/// Implementations never run the task inline from `schedule`, so callers may
/// hold their own locks while scheduling.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, delay: StdDuration, task: Task) -> TimerHandle;
}

/// Cancellation handle for a scheduled task.
///
/// Dropping the handle does not cancel the task.
pub struct TimerHandle {
    canceller: Box<dyn FnOnce() + Send + 'static>,
}

impl TimerHandle {
    pub fn new(canceller: impl FnOnce() + Send + 'static) -> Self {
        Self {
            canceller: Box::new(canceller),
        }
    }

    /// Handle for a task that will never run
    pub fn detached() -> Self {
        Self::new(|| {})
    }

    /// Cancel the task if it has not fired yet
    pub fn cancel(self) {
        (self.canceller)()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

/// Scheduler backed by tokio timers
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    handle: Option<Handle>,
}

impl TokioScheduler {
    /// Use the runtime current at construction time, if any
    pub fn new() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, delay: StdDuration, task: Task) -> TimerHandle {
        let Some(runtime) = self.handle.clone().or_else(|| Handle::try_current().ok()) else {
            warn!(
                delay_ms = delay.as_millis() as u64,
                "No tokio runtime available, task will not be scheduled"
            );
            return TimerHandle::detached();
        };

        // measured from the schedule call, not from the task's first poll
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        let join = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            task();
        });
        let abort = join.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}

#[derive(Default)]
struct ManualQueue {
    next_seq: u64,
    tasks: BTreeMap<(DateTime<Utc>, u64), Task>,
}

/// Scheduler driven by a [`ManualClock`].
///
/// Tasks fire only when [`ManualScheduler::advance`] moves the clock past their
/// due instant, in due order.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    queue: Arc<Mutex<ManualQueue>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            queue: Arc::new(Mutex::new(ManualQueue::default())),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Number of tasks still waiting to fire
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }

    /// Advance the clock, running every task that becomes due on the way
    pub fn advance(&self, by: Duration) {
        let target = self.clock.now() + by;

        loop {
            let next = {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                match queue.tasks.keys().next().copied() {
                    Some(key) if key.0 <= target => queue.tasks.remove(&key).map(|t| (key.0, t)),
                    _ => None,
                }
            };

            match next {
                Some((due, task)) => {
                    self.clock.set(due);
                    task();
                }
                None => break,
            }
        }

        self.clock.set(target);
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.clock.now())
            .field("pending", &self.pending())
            .finish()
    }
}

impl TaskScheduler for ManualScheduler {
    fn schedule(&self, delay: StdDuration, task: Task) -> TimerHandle {
        let now = self.clock.now();
        let due = Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let key = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let key = (due, queue.next_seq);
            queue.next_seq += 1;
            queue.tasks.insert(key, task);
            key
        };
        debug!(due = %due, "Manual task scheduled");

        let queue = Arc::downgrade(&self.queue);
        TimerHandle::new(move || {
            if let Some(queue) = queue.upgrade() {
                queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .tasks
                    .remove(&key);
            }
        })
    }
}
