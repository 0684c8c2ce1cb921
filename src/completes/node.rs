//! Continuation nodes: one outcome cell plus the logic that fills it.
//!
//! A node is attached to its antecedent by subscribing a listener on the
//! antecedent's cell. When the antecedent resolves, the listener runs the
//! node's stage and resolves the node, which in turn wakes its own
//! dependents. A node with a timeout races its stage against a one-shot
//! scheduler task; whichever resolves the cell first wins and the loser is
//! discarded.

use parking_lot::Mutex;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::cell::OutcomeCell;
use super::stage::{Cause, FailedOutcome, Payload, Resolution, Stage, StageKind, StageOptions, Step};
use super::{Completes, Value};
use crate::error::{Error, ErrorKind};
use crate::scheduler::{CancelHandle, Scheduled, SchedulerHandle};
use crate::tracing_compat::{debug, trace, warn};

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every node of one pipeline.
pub(crate) struct Pipeline {
    scheduler: Option<SchedulerHandle>,
    failed: AtomicBool,
}

impl Pipeline {
    pub(crate) fn new(scheduler: Option<SchedulerHandle>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            failed: AtomicBool::new(false),
        })
    }

    /// Sticky: stays set even after a later stage recovers.
    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

pub(crate) struct Node<T> {
    id: u64,
    kind: StageKind,
    antecedent: Option<u64>,
    pipeline: Arc<Pipeline>,
    pub(crate) cell: OutcomeCell<T>,
    timer: Mutex<Option<CancelHandle>>,
}

impl<T: Value> Node<T> {
    fn new(
        kind: StageKind,
        pipeline: Arc<Pipeline>,
        antecedent: Option<u64>,
        cell: OutcomeCell<T>,
    ) -> Self {
        Self {
            id: NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            antecedent,
            pipeline,
            cell,
            timer: Mutex::new(None),
        }
    }

    pub(crate) fn root(pipeline: Arc<Pipeline>) -> Arc<Self> {
        Arc::new(Self::new(StageKind::Root, pipeline, None, OutcomeCell::new()))
    }

    pub(crate) fn root_resolved(pipeline: Arc<Pipeline>, resolution: Resolution<T>) -> Arc<Self> {
        if resolution.is_failed() {
            pipeline.mark_failed();
        }
        let cell = OutcomeCell::resolved(resolution);
        Arc::new(Self::new(StageKind::Root, pipeline, None, cell))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> StageKind {
        self.kind
    }

    pub(crate) fn antecedent(&self) -> Option<u64> {
        self.antecedent
    }

    pub(crate) fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Creates a node running `stage` once `antecedent` resolves.
    pub(crate) fn attach<S: Value>(
        antecedent: &Arc<Node<S>>,
        stage: Stage<S, T>,
        options: StageOptions<S>,
    ) -> Arc<Self> {
        let node = Arc::new(Self::new(
            stage.kind(),
            Arc::clone(&antecedent.pipeline),
            Some(antecedent.id),
            OutcomeCell::new(),
        ));
        trace!(
            stage = node.id,
            antecedent = antecedent.id,
            kind = node.kind.as_str(),
            "stage attached"
        );

        let StageOptions {
            failed_outcome,
            timeout,
        } = options;
        if let Some(timeout) = timeout {
            let fallback = failed_outcome
                .as_ref()
                .map(|sentinel| Payload::new(sentinel.value().clone()));
            node.arm_timeout(timeout, fallback);
        }

        let target = Arc::clone(&node);
        antecedent.cell.subscribe(Box::new(move |input: &Resolution<S>| {
            target.run_stage(stage, failed_outcome, input);
        }));
        node
    }

    /// Resolves the node if still pending. Returns false for race losers.
    pub(crate) fn resolve(&self, resolution: Resolution<T>) -> bool {
        let pipeline = &self.pipeline;
        let drain = self.cell.try_resolve(resolution, |res| {
            if res.is_failed() {
                pipeline.mark_failed();
            }
        });
        let Some(drain) = drain else {
            trace!(stage = self.id, "stage already resolved, resolution dropped");
            return false;
        };
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        debug!(
            stage = self.id,
            kind = self.kind.as_str(),
            failed = self.cell.is_failed(),
            "stage resolved"
        );
        drain.run();
        true
    }

    fn run_stage<S: Value>(
        self: &Arc<Self>,
        stage: Stage<S, T>,
        failed_outcome: Option<FailedOutcome<S>>,
        input: &Resolution<S>,
    ) {
        if self.cell.is_completed() {
            trace!(stage = self.id, "timed out before antecedent resolved, stage skipped");
            return;
        }
        let next = match input {
            Resolution::Succeeded(value) => {
                if failed_outcome
                    .as_ref()
                    .is_some_and(|sentinel| sentinel.matches(value))
                {
                    debug!(stage = self.id, "antecedent outcome matched the failed outcome");
                    Resolution::inherit(&Cause::Outcome(Some(Payload::new(value.clone()))))
                } else {
                    match stage.on_success(value.clone()) {
                        Step::Resolve(resolution) => resolution,
                        Step::Follow(inner) => {
                            self.follow(&inner);
                            return;
                        }
                    }
                }
            }
            Resolution::Failed { value, cause } => stage.on_failure(value.as_ref(), cause),
        };
        self.resolve(next);
    }

    /// Mirrors the resolution of a completion returned by a flattening stage.
    fn follow(self: &Arc<Self>, inner: &Completes<T>) {
        trace!(stage = self.id, inner = inner.node().id, "following inner completion");
        let target = Arc::clone(self);
        inner
            .node()
            .cell
            .subscribe(Box::new(move |res: &Resolution<T>| {
                target.resolve(res.clone());
            }));
    }

    fn arm_timeout(self: &Arc<Self>, timeout: Duration, fallback: Option<Payload>) {
        let Some(scheduler) = self.pipeline.scheduler.as_ref() else {
            warn!(stage = self.id, "timeout requested on a pipeline without a scheduler");
            self.resolve(Resolution::from_error(
                Error::new(ErrorKind::NoScheduler)
                    .with_message("create the pipeline with Completes::using to arm timeouts"),
            ));
            return;
        };
        let handle = scheduler.schedule_once(Expiry(Arc::downgrade(self)), fallback, timeout);
        if handle.is_cancelled() {
            self.resolve(Resolution::from_error(Error::new(ErrorKind::SchedulerClosed)));
            return;
        }
        debug!(
            stage = self.id,
            task = handle.id().as_u64(),
            timeout_ms = timeout.as_millis() as u64,
            "timeout armed"
        );
        *self.timer.lock() = Some(handle);
    }

    fn expire(&self, fallback: Option<Payload>) {
        let value = fallback.as_ref().and_then(Payload::downcast::<T>);
        let timed_out = self.resolve(Resolution::Failed {
            value,
            cause: Cause::Outcome(fallback),
        });
        if timed_out {
            debug!(stage = self.id, "stage timed out");
        }
    }
}

/// Scheduler target that fails a node when its timeout fires.
struct Expiry<T>(Weak<Node<T>>);

impl<T: Value> Scheduled<Option<Payload>> for Expiry<T> {
    fn interval_signal(&self, fallback: &Option<Payload>) {
        if let Some(node) = self.0.upgrade() {
            node.expire(fallback.clone());
        }
    }
}

/// A node with its value type erased; used for pipeline-level awaits.
pub(crate) trait AnyNode: Send + Sync {
    fn wait(&self, timeout: Option<Duration>) -> bool;
    fn value_type(&self) -> &'static str;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Value> AnyNode for Node<T> {
    fn wait(&self, timeout: Option<Duration>) -> bool {
        self.cell.wait(timeout)
    }

    fn value_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("antecedent", &self.antecedent)
            .field("cell", &self.cell)
            .finish_non_exhaustive()
    }
}
