//! Scheduler end-to-end tests: one-shot and repeating timers, cancellation,
//! close semantics and environment configuration.

#[macro_use]
mod common;

use common::*;
use completes::{Scheduled, Scheduler, SchedulerConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

/// Counts signals and records the data it was scheduled with.
#[derive(Default)]
struct Probe {
    signals: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

/// Scheduled target that reports into a shared [`Probe`].
struct Target(Arc<Probe>);

impl Scheduled<String> for Target {
    fn interval_signal(&self, data: &String) {
        self.0.signals.fetch_add(1, Ordering::SeqCst);
        self.0.seen.lock().push(data.clone());
    }
}

impl Probe {
    fn target(self: &Arc<Self>) -> Target {
        Target(Arc::clone(self))
    }

    fn signals(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }
}

#[test]
fn one_shot_fires_once_with_its_data() {
    init_test("one_shot_fires_once_with_its_data");
    let scheduler = test_scheduler("one-shot");
    let probe = Arc::new(Probe::default());
    let handle = scheduler.schedule_once(
        probe.target(),
        "payload".to_string(),
        Duration::from_millis(5),
    );

    assert!(wait_until(SETTLE_TIMEOUT, || probe.signals() == 1));
    assert!(wait_until(SETTLE_TIMEOUT, || handle.is_finished()));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(probe.signals(), 1);
    assert_eq!(*probe.seen.lock(), vec!["payload".to_string()]);
    assert_eq!(handle.fire_count(), 1);
    assert!(!handle.cancel(), "finished one-shot cannot be cancelled");
    assert_eq!(scheduler.active_tasks(), 0);
    test_complete!("one_shot_fires_once_with_its_data");
}

#[test]
fn one_shots_fire_in_deadline_order() {
    init_test("one_shots_fire_in_deadline_order");
    let scheduler = test_scheduler("ordering");
    let order = Arc::new(Mutex::new(Vec::new()));
    let delays = [40_u64, 10, 25];
    for delay in delays {
        let order = Arc::clone(&order);
        scheduler.schedule_once(
            move |tag: &u64| order.lock().push(*tag),
            delay,
            Duration::from_millis(delay),
        );
    }
    assert!(wait_until(SETTLE_TIMEOUT, || order.lock().len() == 3));
    assert_eq!(*order.lock(), vec![10, 25, 40]);
}

#[test]
fn cancelled_one_shot_never_fires() {
    init_test("cancelled_one_shot_never_fires");
    let scheduler = test_scheduler("cancel-once");
    let probe = Arc::new(Probe::default());
    let handle = scheduler.schedule_once(
        probe.target(),
        "never".to_string(),
        Duration::from_millis(50),
    );
    assert!(handle.cancel());
    assert!(handle.is_cancelled());
    assert!(!handle.cancel(), "second cancel reports nothing to do");
    assert_eq!(scheduler.active_tasks(), 0);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(probe.signals(), 0);
}

#[test]
fn repeating_task_fires_until_cancelled() {
    init_test("repeating_task_fires_until_cancelled");
    let scheduler = test_scheduler("repeating");
    let probe = Arc::new(Probe::default());
    let handle = scheduler.schedule(
        probe.target(),
        "tick".to_string(),
        Duration::ZERO,
        Duration::from_millis(5),
    );

    assert!(wait_until(SETTLE_TIMEOUT, || probe.signals() >= 3));
    assert!(handle.cancel());
    thread::sleep(Duration::from_millis(20));
    let after_cancel = probe.signals();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.signals(), after_cancel, "no ticks after cancel settles");
    assert!(probe.seen.lock().iter().all(|d| d == "tick"));
}

#[test]
fn slow_repeating_callback_skips_ticks() {
    init_test("slow_repeating_callback_skips_ticks");
    let scheduler = test_scheduler("slow");
    let running = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let (r, o, n) = (Arc::clone(&running), Arc::clone(&overlap), Arc::clone(&runs));
    let handle = scheduler.schedule(
        move |_: &()| {
            if r.fetch_add(1, Ordering::SeqCst) > 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(20));
            r.fetch_sub(1, Ordering::SeqCst);
            n.fetch_add(1, Ordering::SeqCst);
        },
        (),
        Duration::ZERO,
        Duration::from_millis(2),
    );

    assert!(wait_until(SETTLE_TIMEOUT, || runs.load(Ordering::SeqCst) >= 3));
    handle.cancel();
    assert_eq!(overlap.load(Ordering::SeqCst), 0, "runs never overlap");
    assert!(handle.fire_count() >= 3);
}

#[test]
fn short_timer_fires_on_time_behind_slow_callbacks() {
    init_test("short_timer_fires_on_time_behind_slow_callbacks");
    let scheduler = test_scheduler("independent");
    let slow_done = Arc::new(AtomicUsize::new(0));
    for _ in 0..6 {
        let done = Arc::clone(&slow_done);
        scheduler.schedule_once(
            move |_: &()| {
                thread::sleep(Duration::from_millis(800));
                done.fetch_add(1, Ordering::SeqCst);
            },
            (),
            Duration::ZERO,
        );
    }

    let started = Instant::now();
    let fired_at = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&fired_at);
    scheduler.schedule_once(
        move |_: &()| *sink.lock() = Some(started.elapsed()),
        (),
        Duration::from_millis(20),
    );

    assert!(wait_until(SETTLE_TIMEOUT, || fired_at.lock().is_some()));
    let elapsed = fired_at.lock().unwrap_or_default();
    assert_with_log!(
        elapsed < Duration::from_millis(400),
        "short timer not delayed by running callbacks",
        "< 400ms",
        elapsed
    );
    assert_eq!(slow_done.load(Ordering::SeqCst), 0, "slow callbacks still running");
    assert!(wait_until(SETTLE_TIMEOUT, || slow_done.load(Ordering::SeqCst) == 6));
}

#[test]
fn panicking_callback_does_not_stop_scheduler() {
    init_test("panicking_callback_does_not_stop_scheduler");
    let scheduler = test_scheduler("panic");
    scheduler.schedule_once(
        |_: &()| panic!("callback exploded"),
        (),
        Duration::from_millis(1),
    );
    let probe = Arc::new(Probe::default());
    scheduler.schedule_once(
        probe.target(),
        "after".to_string(),
        Duration::from_millis(20),
    );
    assert!(wait_until(SETTLE_TIMEOUT, || probe.signals() == 1));
    assert!(!scheduler.is_closed());
}

#[test]
fn close_cancels_outstanding_tasks() {
    init_test("close_cancels_outstanding_tasks");
    let scheduler = test_scheduler("close");
    let probe = Arc::new(Probe::default());
    let pending = scheduler.schedule_once(
        probe.target(),
        "late".to_string(),
        Duration::from_secs(30),
    );
    let repeating = scheduler.schedule(
        probe.target(),
        "late".to_string(),
        Duration::from_secs(30),
        Duration::from_secs(30),
    );
    assert_eq!(scheduler.active_tasks(), 2);

    let started = Instant::now();
    scheduler.close();
    assert!(started.elapsed() < Duration::from_secs(5), "close does not wait for deadlines");
    assert!(scheduler.is_closed());
    assert!(pending.is_cancelled());
    assert!(repeating.is_cancelled());
    assert_eq!(scheduler.active_tasks(), 0);

    scheduler.close();
    let refused = scheduler.schedule_once(
        probe.target(),
        "refused".to_string(),
        Duration::ZERO,
    );
    assert!(refused.is_cancelled());
    assert_eq!(probe.signals(), 0);
}

#[test]
fn handle_outlives_scheduler() {
    init_test("handle_outlives_scheduler");
    let handle = {
        let scheduler = test_scheduler("dropped");
        scheduler.handle()
    };
    assert!(handle.is_closed());
    let task = handle.schedule_once(|_: &()| {}, (), Duration::ZERO);
    assert!(task.is_cancelled());
}

#[test]
fn close_from_inside_a_callback_returns() {
    init_test("close_from_inside_a_callback_returns");
    let scheduler = Arc::new(test_scheduler("self-close"));
    let closed = Arc::new(AtomicUsize::new(0));
    let target = Arc::clone(&scheduler);
    let flag = Arc::clone(&closed);
    scheduler.schedule_once(
        move |_: &()| {
            target.close();
            flag.fetch_add(1, Ordering::SeqCst);
        },
        (),
        Duration::from_millis(1),
    );
    assert!(wait_until(SETTLE_TIMEOUT, || closed.load(Ordering::SeqCst) == 1));
    assert!(scheduler.is_closed());
}

#[test]
fn config_from_env_names_threads() {
    init_test("config_from_env_names_threads");
    std::env::set_var(completes::scheduler::ENV_THREAD_NAME_PREFIX, "env-named");
    let config = SchedulerConfig::from_env();
    std::env::remove_var(completes::scheduler::ENV_THREAD_NAME_PREFIX);
    let config = config.expect("valid env");
    assert_eq!(config.thread_name_prefix, "env-named");

    let scheduler = Scheduler::with_config(config);
    let name = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&name);
    scheduler.schedule_once(
        move |_: &()| *sink.lock() = thread::current().name().map(str::to_owned),
        (),
        Duration::ZERO,
    );
    assert!(wait_until(SETTLE_TIMEOUT, || name.lock().is_some()));
    let name = name.lock().clone().unwrap_or_default();
    assert!(name.starts_with("env-named-dispatch-"), "got {name}");
}
