//! Repeating (stream) mode.
//!
//! A [`Repeating`] pipeline is built once and then applied to every value a
//! producer delivers, instead of resolving a single time:
//!
//! ```ignore
//! let feed = Repeating::<i32>::new();
//! let armed = feed.and_then(|v| v * 2).and_then_consume(|v| println!("{v}")).repeat();
//! feed.with(1);
//! feed.with(2);
//! assert_eq!(armed.latest(), Some(4));
//! ```
//!
//! Deliveries and (re-)arming take the same re-entrant delivery lock, so each
//! value runs the armed pipeline exactly once, in the order it was delivered.
//! Values delivered before the first `repeat()` are buffered and replayed
//! when the pipeline is armed. A stage may deliver to its own feed; the
//! nested value is processed inline.
//!
//! This mode is experimental: stages cannot carry sentinels or timeouts.

use parking_lot::{Condvar, Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Value;
use crate::tracing_compat::{debug, trace, warn};

type Sink<I> = Arc<dyn Fn(I) + Send + Sync>;

struct FeedState<I> {
    sink: Option<Sink<I>>,
    backlog: VecDeque<I>,
}

struct Feed<I> {
    delivery: ReentrantMutex<()>,
    state: Mutex<FeedState<I>>,
}

/// A pipeline that runs once per delivered value.
pub struct Repeating<I, T = I> {
    feed: Arc<Feed<I>>,
    pipeline: Arc<dyn Fn(I) -> T + Send + Sync>,
}

impl<I: Value> Repeating<I, I> {
    /// Creates an unarmed feed with an identity pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            feed: Arc::new(Feed {
                delivery: ReentrantMutex::new(()),
                state: Mutex::new(FeedState {
                    sink: None,
                    backlog: VecDeque::new(),
                }),
            }),
            pipeline: Arc::new(|value| value),
        }
    }
}

impl<I: Value> Default for Repeating<I, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Value, T: Value> Repeating<I, T> {
    /// Appends a transformation applied to every delivery.
    #[must_use]
    pub fn and_then<R, F>(&self, f: F) -> Repeating<I, R>
    where
        R: Value,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let prev = Arc::clone(&self.pipeline);
        Repeating {
            feed: Arc::clone(&self.feed),
            pipeline: Arc::new(move |value| f(prev(value))),
        }
    }

    /// Appends an observer; the value passes through unchanged.
    #[must_use]
    pub fn and_then_consume<F>(&self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let prev = Arc::clone(&self.pipeline);
        Self {
            feed: Arc::clone(&self.feed),
            pipeline: Arc::new(move |value| {
                let out = prev(value);
                f(&out);
                out
            }),
        }
    }

    /// Delivers a value.
    ///
    /// Returns true if an armed pipeline processed it, false if it was
    /// buffered until the next [`Self::repeat`].
    pub fn with(&self, value: I) -> bool {
        let _delivery = self.feed.delivery.lock();
        let sink = {
            let mut state = self.feed.state.lock();
            if let Some(sink) = state.sink.clone() {
                sink
            } else {
                state.backlog.push_back(value);
                trace!(buffered = state.backlog.len(), "delivery buffered until armed");
                return false;
            }
        };
        sink(value);
        true
    }

    /// Arms this pipeline for all buffered and future deliveries.
    ///
    /// Re-arming replaces the previously armed pipeline of the same feed.
    pub fn repeat(&self) -> Armed<T> {
        let progress = Arc::new(Progress::new());
        let pipeline = Arc::clone(&self.pipeline);
        let target = Arc::clone(&progress);
        let sink: Sink<I> = Arc::new(move |value: I| {
            match catch_unwind(AssertUnwindSafe(|| pipeline(value))) {
                Ok(out) => target.record(Some(out)),
                Err(payload) => {
                    warn!(
                        panic = %crate::error::payload_to_string(payload.as_ref()),
                        "repeating stage panicked, delivery dropped"
                    );
                    target.record(None);
                }
            }
        });

        let _delivery = self.feed.delivery.lock();
        let backlog = {
            let mut state = self.feed.state.lock();
            state.sink = Some(Arc::clone(&sink));
            std::mem::take(&mut state.backlog)
        };
        debug!(replayed = backlog.len(), "repeating pipeline armed");
        for value in backlog {
            sink(value);
        }
        Armed { progress }
    }

    /// Number of deliveries waiting for the pipeline to be armed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.feed.state.lock().backlog.len()
    }
}

impl<I, T> Clone for Repeating<I, T> {
    fn clone(&self) -> Self {
        Self {
            feed: Arc::clone(&self.feed),
            pipeline: Arc::clone(&self.pipeline),
        }
    }
}

impl<I, T> fmt::Debug for Repeating<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.feed.state.lock();
        f.debug_struct("Repeating")
            .field("armed", &state.sink.is_some())
            .field("buffered", &state.backlog.len())
            .finish()
    }
}

struct Counters<T> {
    latest: Option<T>,
    deliveries: u64,
    failures: u64,
}

struct Progress<T> {
    counters: Mutex<Counters<T>>,
    condvar: Condvar,
}

impl<T: Clone> Progress<T> {
    fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                latest: None,
                deliveries: 0,
                failures: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    fn record(&self, out: Option<T>) {
        let mut counters = self.counters.lock();
        counters.deliveries += 1;
        match out {
            Some(out) => counters.latest = Some(out),
            None => counters.failures += 1,
        }
        self.condvar.notify_all();
    }
}

/// Observer of an armed repeating pipeline.
#[derive(Clone)]
pub struct Armed<T> {
    progress: Arc<Progress<T>>,
}

impl<T: Clone> Armed<T> {
    /// Output of the most recent successful delivery.
    #[must_use]
    pub fn latest(&self) -> Option<T> {
        self.progress.counters.lock().latest.clone()
    }

    /// Number of deliveries processed, including failed ones.
    #[must_use]
    pub fn deliveries(&self) -> u64 {
        self.progress.counters.lock().deliveries
    }

    /// Number of deliveries dropped because a stage panicked.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.progress.counters.lock().failures
    }

    /// Blocks until at least `count` deliveries were processed or `timeout`
    /// elapses. Returns true if the count was reached.
    pub fn wait_for(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut counters = self.progress.counters.lock();
        while counters.deliveries < count {
            let Some(deadline) = deadline else {
                self.progress.condvar.wait(&mut counters);
                continue;
            };
            if self
                .progress
                .condvar
                .wait_until(&mut counters, deadline)
                .timed_out()
            {
                return counters.deliveries >= count;
            }
        }
        true
    }
}

impl<T> fmt::Debug for Armed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters = self.progress.counters.lock();
        f.debug_struct("Armed")
            .field("deliveries", &counters.deliveries)
            .field("failures", &counters.failures)
            .finish_non_exhaustive()
    }
}
