//! Dispatch pool that runs fired timer callbacks.
//!
//! The driver thread only pops deadlines; every callback is handed to this
//! pool so a slow callback cannot delay other timers.
//!
//! ## Thread Lifecycle
//!
//! `min_threads` workers are spawned eagerly. A new worker is spawned whenever
//! a job is queued and no idle worker is left to take it, so a due callback
//! never waits behind a running one. Workers above the minimum retire after
//! `idle_timeout` without work.
//!
//! ## Shutdown
//!
//! After [`DispatchPool::shutdown`] workers drain whatever is still queued and
//! exit. Jobs belonging to cancelled tasks observe the cancellation and return
//! without invoking the callback.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::tracing_compat::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Returns true when called from a dispatch worker.
pub(crate) fn on_dispatch_thread() -> bool {
    IN_DISPATCH.with(Cell::get)
}

pub(crate) struct DispatchPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    min_threads: usize,
    active_threads: AtomicUsize,
    busy_threads: AtomicUsize,
    pending_count: AtomicUsize,
    queue: SegQueue<Job>,
    shutdown: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
    idle_timeout: Duration,
    thread_name_prefix: String,
    next_thread: AtomicUsize,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DispatchPool {
    pub(crate) fn new(min_threads: usize, idle_timeout: Duration, thread_name_prefix: &str) -> Self {
        let inner = Arc::new(PoolInner {
            min_threads,
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            idle_timeout,
            thread_name_prefix: thread_name_prefix.to_string(),
            next_thread: AtomicUsize::new(0),
            thread_handles: Mutex::new(Vec::with_capacity(min_threads)),
        });

        for _ in 0..min_threads {
            spawn_thread(&inner);
        }

        Self { inner }
    }

    /// Queues a job. Jobs submitted after shutdown are dropped.
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if self.is_shutdown() {
            trace!("dispatch pool shut down, dropping job");
            return;
        }
        self.inner.queue.push(Box::new(job));
        self.inner.pending_count.fetch_add(1, Ordering::AcqRel);

        // Retiring workers leave under this lock, so the idle count seen here
        // cannot include a worker that is about to exit.
        let _guard = self.inner.mutex.lock();
        maybe_spawn_thread(&self.inner);
        self.inner.condvar.notify_one();
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    pub(crate) fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    pub(crate) fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_all();
    }

    /// Shuts down and waits for all workers to exit.
    ///
    /// Returns `false` if `timeout` elapsed first. Called from a worker, it
    /// only signals shutdown: a worker cannot wait for itself.
    pub(crate) fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        if on_dispatch_thread() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.shutdown();
            thread::sleep(Duration::from_millis(5).min(remaining));
        }

        let handles: Vec<_> = self.inner.thread_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPool")
            .field("min_threads", &self.inner.min_threads)
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn spawn_thread(inner: &Arc<PoolInner>) {
    let worker = Arc::clone(inner);
    let index = inner.next_thread.fetch_add(1, Ordering::Relaxed);
    inner.active_threads.fetch_add(1, Ordering::AcqRel);
    let name = format!("{}-dispatch-{}", inner.thread_name_prefix, index);

    let spawned = thread::Builder::new().name(name).spawn(move || {
        IN_DISPATCH.with(|flag| flag.set(true));
        worker_loop(&worker);
    });

    match spawned {
        Ok(handle) => {
            let mut handles = inner.thread_handles.lock();
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
        Err(_) => {
            inner.active_threads.fetch_sub(1, Ordering::AcqRel);
            debug!(index, "failed to spawn dispatch thread");
        }
    }
}

/// Spawns a worker when queued jobs outnumber idle workers. Caller holds
/// `inner.mutex`.
fn maybe_spawn_thread(inner: &Arc<PoolInner>) {
    let active = inner.active_threads.load(Ordering::Acquire);
    let busy = inner.busy_threads.load(Ordering::Acquire);
    let pending = inner.pending_count.load(Ordering::Acquire);

    if pending > active.saturating_sub(busy) {
        trace!(active, busy, pending, "all dispatch workers busy, spawning");
        spawn_thread(inner);
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        // Counted busy before popping so a job in hand is never mistaken for
        // an idle worker.
        inner.busy_threads.fetch_add(1, Ordering::AcqRel);
        if let Some(job) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::AcqRel);
            job();
            inner.busy_threads.fetch_sub(1, Ordering::AcqRel);
            continue;
        }
        inner.busy_threads.fetch_sub(1, Ordering::AcqRel);

        let mut guard = inner.mutex.lock();
        if inner.shutdown.load(Ordering::Acquire) && inner.queue.is_empty() {
            inner.active_threads.fetch_sub(1, Ordering::AcqRel);
            break;
        }
        if !inner.queue.is_empty() {
            continue;
        }

        if inner.active_threads.load(Ordering::Acquire) > inner.min_threads {
            let timed_out = inner
                .condvar
                .wait_for(&mut guard, inner.idle_timeout)
                .timed_out();
            if timed_out
                && inner.queue.is_empty()
                && inner.active_threads.load(Ordering::Acquire) > inner.min_threads
            {
                trace!("retiring idle dispatch thread");
                inner.active_threads.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        } else {
            inner.condvar.wait(&mut guard);
        }
    }
}
