//! Scheduled task records and their cancellation handles.
//!
//! Each task moves through a small state machine:
//!
//! ```text
//!            try_begin            finish (one-shot)
//!   Armed ───────────▶ Running ─────────────────▶ Fired
//!     ▲                   │
//!     └───────────────────┘ finish (repeating)
//!
//!   Armed | Running ── cancel ──▶ Cancelled
//! ```
//!
//! A repeating task whose previous callback is still `Running` when the next
//! tick comes due skips that tick instead of running concurrently.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::SchedulerInner;

const ARMED: u8 = 0;
const RUNNING: u8 = 1;
const FIRED: u8 = 2;
const CANCELLED: u8 = 3;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a scheduled task, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Result of trying to start a callback run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Begin {
    /// The caller owns this run and must call [`ScheduledTask::finish`].
    Run,
    /// A previous run of the same task has not returned yet.
    Busy,
    /// The task was cancelled or has already fired.
    Done,
}

pub(crate) struct ScheduledTask {
    id: TaskId,
    interval: Option<Duration>,
    state: AtomicU8,
    fires: AtomicU64,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl ScheduledTask {
    pub(crate) fn new(interval: Option<Duration>, callback: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            id: TaskId::next(),
            interval,
            state: AtomicU8::new(ARMED),
            fires: AtomicU64::new(0),
            callback,
        }
    }

    /// A task that was never armed; used when scheduling on a closed scheduler.
    pub(crate) fn cancelled(interval: Option<Duration>) -> Self {
        let task = Self::new(interval, Box::new(|| {}));
        task.state.store(CANCELLED, Ordering::Release);
        task
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub(crate) fn repeats(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), FIRED | CANCELLED)
    }

    pub(crate) fn fire_count(&self) -> u64 {
        self.fires.load(Ordering::Acquire)
    }

    pub(crate) fn try_begin(&self) -> Begin {
        match self
            .state
            .compare_exchange(ARMED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Begin::Run,
            Err(RUNNING) => Begin::Busy,
            Err(_) => Begin::Done,
        }
    }

    /// Invokes the callback. Only valid after [`Self::try_begin`] returned `Run`.
    pub(crate) fn run(&self) {
        (self.callback)();
        self.fires.fetch_add(1, Ordering::AcqRel);
    }

    /// Ends a run; a cancel that raced with the run wins.
    pub(crate) fn finish(&self) {
        let next = if self.repeats() { ARMED } else { FIRED };
        let _ = self
            .state
            .compare_exchange(RUNNING, next, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Returns true if the task could still have run at least once more.
    pub(crate) fn cancel(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let eligible = match current {
                ARMED => true,
                RUNNING => self.repeats(),
                _ => return false,
            };
            match self.state.compare_exchange_weak(
                current,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return eligible,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            ARMED => "armed",
            RUNNING => "running",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("state", &state)
            .field("fires", &self.fire_count())
            .finish_non_exhaustive()
    }
}

/// Handle returned by every schedule call.
///
/// Dropping the handle does not cancel the task.
#[derive(Clone)]
pub struct CancelHandle {
    task: Arc<ScheduledTask>,
    scheduler: Weak<SchedulerInner>,
}

impl CancelHandle {
    pub(crate) fn new(task: Arc<ScheduledTask>, scheduler: Weak<SchedulerInner>) -> Self {
        Self { task, scheduler }
    }

    /// Cancels the task.
    ///
    /// Returns `true` if the task was still eligible to run: a one-shot task
    /// that had not started, or a repeating task that had not been cancelled.
    /// A callback that is already executing runs to completion.
    pub fn cancel(&self) -> bool {
        let eligible = self.task.cancel();
        if let Some(inner) = self.scheduler.upgrade() {
            inner.forget(self.task.id());
        }
        eligible
    }

    /// Returns true once the task has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Returns true once the task will never run again.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Number of completed callback runs.
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.task.fire_count()
    }

    /// The task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("task", &self.task)
            .finish()
    }
}
