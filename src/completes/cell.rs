//! Single-assignment outcome cell.
//!
//! The cell starts `Pending` and is resolved at most once. Whoever wins the
//! resolution takes the registered listeners and runs them in registration
//! order after the lock is released; every later attempt is a no-op that
//! reports `false`.
//!
//! ```text
//!   Pending ──try_resolve──▶ Resolved(Succeeded | Failed)
//!      │                          │
//!   subscribe: queued         subscribe: runs immediately
//! ```

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::stage::Resolution;

/// Callback registered on a cell.
pub(crate) type Listener<T> = Box<dyn FnOnce(&Resolution<T>) + Send>;

struct CellState<T> {
    resolution: Option<Resolution<T>>,
    listeners: Vec<Listener<T>>,
}

pub(crate) struct OutcomeCell<T> {
    completed: AtomicBool,
    failed: AtomicBool,
    state: Mutex<CellState<T>>,
    condvar: Condvar,
}

/// Listeners handed to the winner of a resolution race.
#[must_use = "listeners only run when the drain is run"]
pub(crate) struct Drain<T> {
    resolution: Resolution<T>,
    listeners: Vec<Listener<T>>,
}

impl<T> Drain<T> {
    pub(crate) fn run(self) {
        let Self {
            resolution,
            listeners,
        } = self;
        for listener in listeners {
            listener(&resolution);
        }
    }
}

impl<T: Clone> OutcomeCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            state: Mutex::new(CellState {
                resolution: None,
                listeners: Vec::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn resolved(resolution: Resolution<T>) -> Self {
        let cell = Self::new();
        cell.failed.store(resolution.is_failed(), Ordering::Release);
        cell.completed.store(true, Ordering::Release);
        cell.state.lock().resolution = Some(resolution);
        cell
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Resolves the cell if it is still pending.
    ///
    /// `before_wake` runs under the lock after the resolution is stored but
    /// before any blocked waiter is released.
    pub(crate) fn try_resolve(
        &self,
        resolution: Resolution<T>,
        before_wake: impl FnOnce(&Resolution<T>),
    ) -> Option<Drain<T>> {
        let mut state = self.state.lock();
        if state.resolution.is_some() {
            return None;
        }
        before_wake(&resolution);
        self.failed.store(resolution.is_failed(), Ordering::Release);
        self.completed.store(true, Ordering::Release);
        state.resolution = Some(resolution.clone());
        let listeners = std::mem::take(&mut state.listeners);
        self.condvar.notify_all();
        drop(state);
        Some(Drain {
            resolution,
            listeners,
        })
    }

    /// Registers `listener`; runs it at once if the cell is already resolved.
    pub(crate) fn subscribe(&self, listener: Listener<T>) {
        let mut state = self.state.lock();
        match state.resolution.clone() {
            Some(resolution) => {
                drop(state);
                listener(&resolution);
            }
            None => state.listeners.push(listener),
        }
    }

    pub(crate) fn resolution(&self) -> Option<Resolution<T>> {
        self.state.lock().resolution.clone()
    }

    /// Blocks until resolved or until `timeout` elapses.
    ///
    /// `None` waits without a deadline. Returns true if the cell is resolved.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_completed() {
            return true;
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        while state.resolution.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut state, deadline).timed_out() {
                        return state.resolution.is_some();
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
        true
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

impl<T> fmt::Debug for OutcomeCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutcomeCell")
            .field("completed", &self.completed.load(Ordering::Acquire))
            .field("failed", &self.failed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completes::stage::Cause;
    use crate::error::{Error, ErrorKind};
    use std::sync::Arc;
    use std::thread;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn succeed(cell: &OutcomeCell<i32>, v: i32) -> bool {
        cell.try_resolve(Resolution::Succeeded(v), |_| {})
            .map(Drain::run)
            .is_some()
    }

    #[test]
    fn first_resolution_wins() {
        init_test("first_resolution_wins");
        let cell = OutcomeCell::new();
        assert!(succeed(&cell, 1));
        assert!(!succeed(&cell, 2));
        let failed = Resolution::Failed {
            value: None,
            cause: Cause::Error(Error::new(ErrorKind::StageFailed)),
        };
        assert!(cell.try_resolve(failed, |_| {}).is_none());
        assert_eq!(cell.resolution().and_then(Resolution::into_value), Some(1));
        assert!(cell.is_completed());
        assert!(!cell.is_failed());
    }

    #[test]
    fn listeners_run_in_registration_order() {
        init_test("listeners_run_in_registration_order");
        let cell = OutcomeCell::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            cell.subscribe(Box::new(move |_: &Resolution<i32>| order.lock().push(i)));
        }
        assert_eq!(cell.listener_count(), 4);
        assert!(succeed(&cell, 10));
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert_eq!(cell.listener_count(), 0);
    }

    #[test]
    fn late_subscriber_runs_immediately() {
        init_test("late_subscriber_runs_immediately");
        let cell = OutcomeCell::new();
        assert!(succeed(&cell, 5));
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        cell.subscribe(Box::new(move |r: &Resolution<i32>| {
            *sink.lock() = r.value().copied();
        }));
        assert_eq!(*seen.lock(), Some(5));
    }

    #[test]
    fn before_wake_runs_only_for_winner() {
        init_test("before_wake_runs_only_for_winner");
        let cell = OutcomeCell::new();
        let mut calls = 0;
        let _ = cell.try_resolve(Resolution::Succeeded(1), |_| calls += 1);
        let _ = cell.try_resolve(Resolution::Succeeded(2), |_| calls += 1);
        assert_eq!(calls, 1);
    }

    #[test]
    fn wait_times_out_when_pending() {
        init_test("wait_times_out_when_pending");
        let cell: OutcomeCell<i32> = OutcomeCell::new();
        assert!(!cell.wait(Some(Duration::from_millis(20))));
    }

    #[test]
    fn wait_wakes_on_resolution_from_other_thread() {
        init_test("wait_wakes_on_resolution_from_other_thread");
        let cell = Arc::new(OutcomeCell::new());
        let producer = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            succeed(&producer, 9)
        });
        assert!(cell.wait(None));
        assert!(handle.join().expect("producer"));
        assert_eq!(cell.resolution().and_then(Resolution::into_value), Some(9));
    }

    #[test]
    fn concurrent_resolvers_single_winner() {
        init_test("concurrent_resolvers_single_winner");
        let cell = Arc::new(OutcomeCell::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || succeed(&cell, i))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("resolver"))
            .filter(|won| *won)
            .count();
        crate::assert_with_log!(winners == 1, "exactly one winner", 1, winners);
    }

    #[test]
    fn pre_resolved_cell() {
        init_test("pre_resolved_cell");
        let cell = OutcomeCell::resolved(Resolution::Succeeded(3));
        assert!(cell.is_completed());
        assert!(cell.wait(Some(Duration::ZERO)));
        assert!(!succeed(&cell, 4));
    }
}
