//! Timer scheduler used by deferred outcomes for timeouts, and usable on its
//! own for one-shot and repeating timers.
//!
//! ```text
//!   schedule_once / schedule ──▶ registry + TimerHeap
//!                                     │
//!                               driver thread  (sleeps until the earliest deadline)
//!                                     │ expired
//!                                     ▼
//!                               DispatchPool ──▶ Scheduled::interval_signal(&data)
//! ```
//!
//! Repeating tasks are fixed-rate: the next deadline is the previous deadline
//! plus the interval, and ticks missed while the process was stalled are
//! skipped rather than replayed. A callback that panics is logged and, for
//! repeating tasks, the schedule continues.

mod config;
mod heap;
mod pool;
mod task;

pub use config::{
    apply_env_overrides, ConfigError, SchedulerConfig, ENV_IDLE_TIMEOUT_MS, ENV_MIN_THREADS,
    ENV_THREAD_NAME_PREFIX,
};
pub use task::{CancelHandle, TaskId};

use heap::TimerHeap;
use parking_lot::{Condvar, Mutex};
use pool::DispatchPool;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use task::{Begin, ScheduledTask};

use crate::tracing_compat::{debug, info, trace, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_INTERVAL: Duration = Duration::from_millis(1);
/// Heap size below which stale entries are left for the driver to skip.
const COMPACT_THRESHOLD: usize = 64;

/// Target of a scheduled task.
///
/// `data` is the value supplied when the task was scheduled; it is passed
/// back unchanged on every firing.
pub trait Scheduled<D>: Send + Sync + 'static {
    /// Called each time the task fires.
    fn interval_signal(&self, data: &D);
}

impl<D, F> Scheduled<D> for F
where
    F: Fn(&D) + Send + Sync + 'static,
{
    fn interval_signal(&self, data: &D) {
        self(data);
    }
}

struct TimerState {
    heap: TimerHeap,
    tasks: HashMap<TaskId, Arc<ScheduledTask>>,
}

pub(crate) struct SchedulerInner {
    state: Mutex<TimerState>,
    condvar: Condvar,
    shutdown: AtomicBool,
    pool: DispatchPool,
    driver: Mutex<Option<JoinHandle<()>>>,
    driver_id: Mutex<Option<ThreadId>>,
}

impl SchedulerInner {
    fn submit(
        self: &Arc<Self>,
        callback: Box<dyn Fn() + Send + Sync>,
        delay: Duration,
        interval: Option<Duration>,
    ) -> CancelHandle {
        let interval = interval.map(|i| i.max(MIN_INTERVAL));
        if self.shutdown.load(Ordering::Acquire) {
            warn!("schedule called on a closed scheduler");
            return CancelHandle::new(Arc::new(ScheduledTask::cancelled(interval)), Weak::new());
        }

        let task = Arc::new(ScheduledTask::new(interval, callback));
        let id = task.id();
        let deadline = deadline_after(delay);
        {
            let mut state = self.state.lock();
            let wake = state.heap.peek_deadline().map_or(true, |next| deadline < next);
            state.heap.insert(id, deadline);
            state.tasks.insert(id, Arc::clone(&task));
            if wake {
                self.condvar.notify_one();
            }
        }
        debug!(
            task = id.as_u64(),
            delay_ms = delay.as_millis() as u64,
            repeating = interval.is_some(),
            "task scheduled"
        );
        CancelHandle::new(task, Arc::downgrade(self))
    }

    /// Drops a task from the registry. Its heap entry is skipped lazily,
    /// unless stale entries now outnumber live ones, in which case the heap
    /// is compacted.
    pub(crate) fn forget(&self, id: TaskId) {
        let mut state = self.state.lock();
        if state.tasks.remove(&id).is_none() {
            return;
        }
        debug!(task = id.as_u64(), "task cancelled");

        let live = state.tasks.len();
        if state.heap.len() >= COMPACT_THRESHOLD && state.heap.len() > live * 2 {
            let TimerState { heap, tasks } = &mut *state;
            let before = heap.len();
            heap.retain(|task| tasks.contains_key(&task));
            trace!(before, after = heap.len(), "timer heap compacted");
        }
    }

    fn dispatch(&self, task: Arc<ScheduledTask>) {
        self.pool.spawn(move || match task.try_begin() {
            Begin::Run => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run())) {
                    warn!(
                        task = task.id().as_u64(),
                        panic = %crate::error::payload_to_string(payload.as_ref()),
                        "scheduled callback panicked"
                    );
                }
                task.finish();
            }
            Begin::Busy => {
                trace!(task = task.id().as_u64(), "previous run still active, tick skipped");
            }
            Begin::Done => {}
        });
    }

    fn close(&self) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }
        let tasks: Vec<Arc<ScheduledTask>> = {
            let mut state = self.state.lock();
            state.heap.clear();
            let drained = state.tasks.drain().map(|(_, task)| task).collect();
            self.condvar.notify_all();
            drained
        };
        let cancelled = tasks.iter().filter(|task| task.cancel()).count();

        let driver = self.driver.lock().take();
        let on_driver = *self.driver_id.lock() == Some(thread::current().id());
        if let Some(handle) = driver {
            if !on_driver {
                if let Err(payload) = handle.join() {
                    warn!(
                        panic = %crate::error::payload_to_string(payload.as_ref()),
                        "scheduler driver panicked"
                    );
                }
            }
        }
        let drained = self.pool.shutdown_and_wait(CLOSE_TIMEOUT);
        info!(cancelled, drained, "scheduler closed");
        true
    }
}

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

fn driver_loop(inner: &SchedulerInner) {
    let mut state = inner.state.lock();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        for expired in state.heap.pop_expired(now) {
            let Some(task) = state.tasks.get(&expired.task).cloned() else {
                trace!(task = expired.task.as_u64(), "stale timer entry skipped");
                continue;
            };
            match task.interval() {
                Some(interval) => {
                    let mut next = expired.deadline + interval;
                    if next <= now {
                        next = now + interval;
                    }
                    state.heap.insert(expired.task, next);
                }
                None => {
                    state.tasks.remove(&expired.task);
                }
            }
            due.push(task);
        }

        if !due.is_empty() {
            parking_lot::MutexGuard::unlocked(&mut state, || {
                for task in due {
                    inner.dispatch(task);
                }
            });
            continue;
        }

        match state.heap.peek_deadline() {
            Some(deadline) => {
                let _ = inner.condvar.wait_until(&mut state, deadline);
            }
            None => inner.condvar.wait(&mut state),
        }
    }
    trace!("scheduler driver exiting");
}

/// Owns the scheduler threads. Dropping it closes the scheduler.
///
/// ```ignore
/// use completes::Scheduler;
/// use std::time::Duration;
///
/// let scheduler = Scheduler::new();
/// let handle = scheduler.schedule_once(|msg: &&str| println!("{msg}"), "tick", Duration::from_millis(10));
/// assert!(handle.cancel());
/// ```
pub struct Scheduler {
    handle: SchedulerHandle,
}

impl Scheduler {
    /// Creates a scheduler with [`SchedulerConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a scheduler with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the driver thread cannot be spawned.
    #[must_use]
    pub fn with_config(mut config: SchedulerConfig) -> Self {
        config.normalize();
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(TimerState {
                heap: TimerHeap::new(),
                tasks: HashMap::new(),
            }),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            pool: DispatchPool::new(
                config.min_dispatch_threads,
                config.idle_timeout,
                &config.thread_name_prefix,
            ),
            driver: Mutex::new(None),
            driver_id: Mutex::new(None),
        });

        let driver_inner = Arc::clone(&inner);
        let driver = thread::Builder::new()
            .name(format!("{}-driver", config.thread_name_prefix))
            .spawn(move || driver_loop(&driver_inner))
            .expect("failed to spawn scheduler driver thread");
        *inner.driver_id.lock() = Some(driver.thread().id());
        *inner.driver.lock() = Some(driver);

        info!(
            prefix = %config.thread_name_prefix,
            min_threads = config.min_dispatch_threads,
            "scheduler started"
        );
        Self {
            handle: SchedulerHandle { inner },
        }
    }

    /// Creates a scheduler from defaults plus `COMPLETES_SCHEDULER_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::with_config(SchedulerConfig::from_env()?))
    }

    /// Returns a cloneable handle to this scheduler.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Schedules a repeating task. See [`SchedulerHandle::schedule`].
    pub fn schedule<D, S>(
        &self,
        target: S,
        data: D,
        initial_delay: Duration,
        interval: Duration,
    ) -> CancelHandle
    where
        S: Scheduled<D>,
        D: Send + Sync + 'static,
    {
        self.handle.schedule(target, data, initial_delay, interval)
    }

    /// Schedules a one-shot task. See [`SchedulerHandle::schedule_once`].
    pub fn schedule_once<D, S>(&self, target: S, data: D, delay: Duration) -> CancelHandle
    where
        S: Scheduled<D>,
        D: Send + Sync + 'static,
    {
        self.handle.schedule_once(target, data, delay)
    }

    /// Cancels every outstanding task and stops the scheduler threads.
    ///
    /// Idempotent. A callback already executing runs to completion.
    pub fn close(&self) {
        self.handle.inner.close();
    }

    /// Returns true once [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Number of tasks that may still fire.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.handle.active_tasks()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.handle.inner.close();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("handle", &self.handle)
            .finish()
    }
}

/// A cloneable handle to a [`Scheduler`].
///
/// Handles do not keep the scheduler running: once the owning `Scheduler`
/// is closed or dropped, scheduling through a handle yields an
/// already-cancelled [`CancelHandle`].
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<SchedulerInner>,
}

impl SchedulerHandle {
    /// Schedules `target` to fire after `initial_delay` and then every
    /// `interval` until cancelled. Intervals shorter than one millisecond
    /// are rounded up.
    pub fn schedule<D, S>(
        &self,
        target: S,
        data: D,
        initial_delay: Duration,
        interval: Duration,
    ) -> CancelHandle
    where
        S: Scheduled<D>,
        D: Send + Sync + 'static,
    {
        let callback = Box::new(move || target.interval_signal(&data));
        self.inner.submit(callback, initial_delay, Some(interval))
    }

    /// Schedules `target` to fire once after `delay`.
    pub fn schedule_once<D, S>(&self, target: S, data: D, delay: Duration) -> CancelHandle
    where
        S: Scheduled<D>,
        D: Send + Sync + 'static,
    {
        let callback = Box::new(move || target.interval_signal(&data));
        self.inner.submit(callback, delay, None)
    }

    /// Returns true once the owning scheduler has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Number of tasks that may still fire.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }
}

impl From<&Scheduler> for SchedulerHandle {
    fn from(scheduler: &Scheduler) -> Self {
        scheduler.handle()
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (timers, tasks) = {
            let state = self.inner.state.lock();
            (state.heap.len(), state.tasks.len())
        };
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.is_closed())
            .field("timers", &timers)
            .field("tasks", &tasks)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&usize) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let target = {
            let hits = Arc::clone(&hits);
            move |step: &usize| {
                hits.fetch_add(*step, Ordering::SeqCst);
            }
        };
        (hits, target)
    }

    #[test]
    fn once_fires_after_delay() {
        init_test("once_fires_after_delay");
        let scheduler = Scheduler::new();
        let (hits, target) = counter();
        let started = Instant::now();
        let handle = scheduler.schedule_once(target, 1, Duration::from_millis(30));

        assert!(crate::test_utils::wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(crate::test_utils::wait_until(Duration::from_secs(1), || {
            handle.is_finished()
        }));
        assert_eq!(handle.fire_count(), 1);
        assert!(!handle.cancel(), "fired one-shot is not eligible");
        assert_eq!(scheduler.active_tasks(), 0);
        crate::test_complete!("once_fires_after_delay");
    }

    #[test]
    fn cancel_before_fire() {
        init_test("cancel_before_fire");
        let scheduler = Scheduler::new();
        let (hits, target) = counter();
        let handle = scheduler.schedule_once(target, 1, Duration::from_millis(50));
        assert_eq!(scheduler.active_tasks(), 1);
        assert!(handle.cancel());
        assert_eq!(scheduler.active_tasks(), 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeating_fires_until_cancelled() {
        init_test("repeating_fires_until_cancelled");
        let scheduler = Scheduler::new();
        let (hits, target) = counter();
        let handle = scheduler.schedule(target, 1, Duration::ZERO, Duration::from_millis(5));

        assert!(crate::test_utils::wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) >= 3
        }));
        assert!(handle.cancel(), "repeating task was still eligible");
        thread::sleep(Duration::from_millis(20));
        let after_cancel = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn earlier_deadline_wakes_driver() {
        init_test("earlier_deadline_wakes_driver");
        let scheduler = Scheduler::new();
        let (late_hits, late) = counter();
        let (early_hits, early) = counter();
        let _late = scheduler.schedule_once(late, 1, Duration::from_secs(30));
        let _early = scheduler.schedule_once(early, 1, Duration::from_millis(10));

        assert!(crate::test_utils::wait_until(Duration::from_secs(2), || {
            early_hits.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_keeps_repeating() {
        init_test("panicking_callback_keeps_repeating");
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handle = scheduler.schedule(
            move |_: &()| {
                seen.fetch_add(1, Ordering::SeqCst);
                panic!("callback failure");
            },
            (),
            Duration::ZERO,
            Duration::from_millis(5),
        );
        assert!(crate::test_utils::wait_until(Duration::from_secs(2), || {
            calls.load(Ordering::SeqCst) >= 2
        }));
        handle.cancel();
    }

    #[test]
    fn close_cancels_everything() {
        init_test("close_cancels_everything");
        let scheduler = Scheduler::new();
        let (hits, target) = counter();
        let target = Arc::new(target);
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let t = Arc::clone(&target);
                scheduler.schedule_once(move |n: &usize| (*t)(n), 1, Duration::from_millis(50))
            })
            .collect();

        scheduler.close();
        assert!(scheduler.is_closed());
        assert_eq!(scheduler.active_tasks(), 0);
        assert!(handles.iter().all(CancelHandle::is_cancelled));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        scheduler.close();
    }

    #[test]
    fn schedule_after_close_returns_cancelled_handle() {
        init_test("schedule_after_close_returns_cancelled_handle");
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();
        drop(scheduler);
        assert!(handle.is_closed());
        let (hits, target) = counter();
        let cancel = handle.schedule_once(target, 1, Duration::ZERO);
        assert!(cancel.is_cancelled());
        assert!(!cancel.cancel());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_entries_are_compacted() {
        init_test("cancelled_entries_are_compacted");
        let scheduler = Scheduler::new();
        let handles: Vec<_> = (0..200)
            .map(|_| scheduler.schedule_once(|_: &()| {}, (), Duration::from_secs(60)))
            .collect();
        for handle in &handles[..190] {
            assert!(handle.cancel());
        }
        let (heap_len, live) = {
            let state = scheduler.handle.inner.state.lock();
            (state.heap.len(), state.tasks.len())
        };
        assert_eq!(live, 10);
        crate::assert_with_log!(
            heap_len <= COMPACT_THRESHOLD,
            "stale entries compacted",
            COMPACT_THRESHOLD,
            heap_len
        );
        assert!(heap_len >= live);
    }

    #[test]
    fn data_is_passed_to_target() {
        init_test("data_is_passed_to_target");
        let scheduler = Scheduler::new();
        let (hits, target) = counter();
        let _handle = scheduler.schedule_once(target, 7, Duration::ZERO);
        assert!(crate::test_utils::wait_until(Duration::from_secs(2), || {
            hits.load(Ordering::SeqCst) == 7
        }));
    }
}
