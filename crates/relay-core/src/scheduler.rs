//! One-shot timer capability shared by the state store, the token manager and
//! modules that batch work.
//!
//! Production code runs on [`TokioScheduler`]. Tests drive a [`ManualScheduler`]
//! whose clock only moves when told to, so debounce windows and refresh buffers
//! can be exercised without waiting on wall-clock time.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Work to run once a timer fires.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Opaque handle for a scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

pub trait Scheduler: Send + Sync {
    /// Current wall-clock instant as seen by this scheduler.
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once after `delay`.
    fn schedule_once(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Cancel a pending timer. Unknown or already-fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);

    /// Pause the calling task for `delay` (retry backoff, rate-limit waits).
    fn sleep(&self, delay: Duration) -> Task;
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scheduler backed by `tokio::time`. Must be used from within a Tokio runtime.
#[derive(Default)]
pub struct TokioScheduler {
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<u64, CancellationToken>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule_once(&self, delay: Duration, task: Task) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        lock(&self.timers).insert(id, cancel.clone());

        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
              _ = cancel.cancelled() => {}
              _ = tokio::time::sleep(delay) => {
                // Once fired, the task is no longer cancellable: a cancel racing
                // with an in-flight write must not abort it half-way.
                lock(&timers).remove(&id);
                task.await;
              }
            }
        });

        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(tok) = lock(&self.timers).remove(&handle.0) {
            tok.cancel();
        }
    }

    fn sleep(&self, delay: Duration) -> Task {
        Box::pin(tokio::time::sleep(delay))
    }
}

struct ManualTimer {
    id: u64,
    due: DateTime<Utc>,
    task: Task,
}

struct ManualState {
    now: DateTime<Utc>,
    next_id: u64,
    timers: Vec<ManualTimer>,
    slept: Vec<Duration>,
}

/// Longest delay the virtual clock represents; later timers are clamped to it.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d.min(FAR_FUTURE)).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Virtual-clock scheduler. Time stands still until [`ManualScheduler::advance`].
///
/// `sleep` returns at once and moves the clock forward by the requested delay,
/// so code that backs off can be driven inline.
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                next_id: 0,
                timers: Vec::new(),
                slept: Vec::new(),
            }),
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.state).timers.len()
    }

    /// Delay until the earliest pending timer, if any.
    pub fn next_due_in(&self) -> Option<Duration> {
        let st = lock(&self.state);
        st.timers
            .iter()
            .map(|t| t.due)
            .min()
            .map(|due| (due - st.now).to_std().unwrap_or_default())
    }

    /// Every delay passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).slept.clone()
    }

    /// Move the clock forward by `by`, running every timer that falls due in
    /// order. Timers scheduled by those tasks run too if they are due by the
    /// end of the window.
    pub async fn advance(&self, by: Duration) {
        let target = {
            let st = lock(&self.state);
            st.now + delta(by)
        };

        loop {
            let next = {
                let mut st = lock(&self.state);
                let idx = st
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.id))
                    .map(|(i, _)| i);
                match idx {
                    Some(i) => {
                        let timer = st.timers.swap_remove(i);
                        if timer.due > st.now {
                            st.now = timer.due;
                        }
                        Some(timer.task)
                    }
                    None => {
                        // A task's sleep may already have moved past the window.
                        if st.now < target {
                            st.now = target;
                        }
                        None
                    }
                }
            };

            match next {
                Some(task) => task.await,
                None => break,
            }
        }
    }

    /// Run whatever is already due without moving the clock.
    pub async fn run_due(&self) {
        self.advance(Duration::ZERO).await;
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        lock(&self.state).now
    }

    fn schedule_once(&self, delay: Duration, task: Task) -> TimerHandle {
        let mut st = lock(&self.state);
        let id = st.next_id;
        st.next_id += 1;
        let due = st.now + delta(delay);
        st.timers.push(ManualTimer { id, due, task });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        lock(&self.state).timers.retain(|t| t.id != handle.0);
    }

    fn sleep(&self, delay: Duration) -> Task {
        let mut st = lock(&self.state);
        st.now = st.now + delta(delay);
        st.slept.push(delay);
        Box::pin(async {})
    }
}
