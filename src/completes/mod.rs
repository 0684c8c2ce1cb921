//! Deferred outcomes with chained continuations.
//!
//! A [`Completes<T>`] is a handle to one stage of a pipeline. The root stage
//! is resolved by a producer calling [`Completes::with`] through any handle
//! of the pipeline; every other stage is resolved by running its
//! continuation when its antecedent resolves.
//!
//! ```text
//!   root ──and_then──▶ s1 ──and_then_to──▶ s2 ──otherwise──▶ s3
//!    ▲                                      │
//!    └── with(v)                        follows inner completion
//! ```
//!
//! # Failure
//!
//! A stage fails when
//! - its antecedent outcome equals the stage's failed-outcome sentinel,
//! - its timeout fires before it resolves, or
//! - its closure panics or returns an error.
//!
//! Forward stages (`and_then*`) short-circuit failures; `otherwise` and
//! `recover_from` handle them. [`Completes::has_failed`] reports whether any
//! stage of the pipeline failed, even if a later stage recovered.
//!
//! # Threading
//!
//! Continuations run on whichever thread resolves their antecedent: the
//! producer calling `with`, the thread that attaches a stage to an already
//! resolved antecedent, or a scheduler dispatch thread when a timeout fires.
//!
//! # Example
//!
//! ```ignore
//! use completes::Completes;
//!
//! let service = Completes::<i32>::new();
//! let client = service.and_then(|v| v * 2).and_then(|v| v + 1);
//! service.with(5);
//! assert_eq!(client.await_outcome(), 11);
//! ```

mod cell;
mod invert;
mod node;
mod repeat;
mod stage;

pub use invert::invert;
pub use repeat::{Armed, Repeating};
pub use stage::StageKind;

use parking_lot::Mutex;
use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::SchedulerHandle;
use crate::tracing_compat::error;
use node::{AnyNode, Node, Pipeline};
use stage::{FailedOutcome, Resolution, Stage, StageOptions};

/// Values that can flow through a pipeline.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Root and most recently attached stage of a pipeline.
struct Tracker {
    root: Arc<dyn AnyNode>,
    last: Mutex<Arc<dyn AnyNode>>,
}

/// Handle to one stage of a deferred-outcome pipeline.
///
/// Cloning is cheap and yields a handle to the same stage.
#[derive(Clone)]
pub struct Completes<T> {
    node: Arc<Node<T>>,
    tracker: Arc<Tracker>,
    pending: StageOptions<T>,
}

impl<T: Value> Completes<T> {
    /// Creates an unresolved root without a scheduler.
    ///
    /// Stages with a timeout attached to this pipeline fail with
    /// [`ErrorKind::NoScheduler`](crate::ErrorKind::NoScheduler).
    #[must_use]
    pub fn new() -> Self {
        Self::from_root(Node::root(Pipeline::new(None)))
    }

    /// Creates an unresolved root whose stages may use timeouts.
    #[must_use]
    pub fn using(scheduler: impl Into<SchedulerHandle>) -> Self {
        Self::from_root(Node::root(Pipeline::new(Some(scheduler.into()))))
    }

    /// Creates a root already resolved with `value`.
    #[must_use]
    pub fn with_success(value: T) -> Self {
        Self::from_root(Node::root_resolved(
            Pipeline::new(None),
            Resolution::Succeeded(value),
        ))
    }

    /// Creates a root already failed with `value` as its failed outcome.
    #[must_use]
    pub fn with_failure(value: T) -> Self {
        Self::from_root(Node::root_resolved(
            Pipeline::new(None),
            Resolution::failed_outcome(value),
        ))
    }

    fn from_root(node: Arc<Node<T>>) -> Self {
        let root: Arc<dyn AnyNode> = Arc::clone(&node) as Arc<dyn AnyNode>;
        Self {
            node,
            tracker: Arc::new(Tracker {
                last: Mutex::new(Arc::clone(&root)),
                root,
            }),
            pending: StageOptions::none(),
        }
    }

    pub(crate) fn node(&self) -> &Arc<Node<T>> {
        &self.node
    }

    fn extend<R: Value>(&self, stage: Stage<T, R>, explicit: StageOptions<T>) -> Completes<R> {
        let options = self.pending.clone().overridden_by(explicit);
        let node = Node::attach(&self.node, stage, options);
        *self.tracker.last.lock() = Arc::clone(&node) as Arc<dyn AnyNode>;
        Completes {
            node,
            tracker: Arc::clone(&self.tracker),
            pending: StageOptions::none(),
        }
    }

    // ---------------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------------

    /// Delivers `value` as the outcome of the pipeline's root.
    ///
    /// Any handle of the pipeline may deliver; continuations then run from
    /// the root as usual. Returns `false` if the root was already resolved,
    /// or if the root does not produce `T`.
    pub fn with(&self, value: T) -> bool {
        self.deliver(Resolution::Succeeded(value))
    }

    /// Fails the pipeline's root with `error`.
    pub fn fail(&self, error: Error) -> bool {
        self.deliver(Resolution::from_error(error))
    }

    fn deliver(&self, resolution: Resolution<T>) -> bool {
        if self.node.kind() == StageKind::Root {
            return self.node.resolve(resolution);
        }
        match Arc::clone(&self.tracker.root).into_any().downcast::<Node<T>>() {
            Ok(root) => root.resolve(resolution),
            Err(_) => {
                error!(
                    error = %Error::type_mismatch(type_name::<T>(), self.tracker.root.value_type()),
                    stage = self.node.id(),
                    "delivery through a stage whose pipeline root has another type"
                );
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Builder
    // ---------------------------------------------------------------------

    /// The next stage attached through the returned handle fails when this
    /// stage's outcome equals `value`; `value` is also its timeout fallback.
    #[must_use]
    pub fn use_failed_outcome_of(&self, value: T) -> Self
    where
        T: PartialEq,
    {
        let mut next = self.clone();
        next.pending.failed_outcome = Some(FailedOutcome::new(value));
        next
    }

    /// The next stage attached through the returned handle fails if it has
    /// not resolved within `timeout` of being attached.
    #[must_use]
    pub fn timeout_within(&self, timeout: Duration) -> Self {
        let mut next = self.clone();
        next.pending.timeout = Some(timeout);
        next
    }

    // ---------------------------------------------------------------------
    // Forward stages
    // ---------------------------------------------------------------------

    /// Transforms the outcome.
    pub fn and_then<R, F>(&self, f: F) -> Completes<R>
    where
        R: Value,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.extend(transform(f), StageOptions::none())
    }

    /// Like [`Self::and_then`], failing instead when the outcome equals `failed_outcome`.
    pub fn and_then_or<R, F>(&self, failed_outcome: T, f: F) -> Completes<R>
    where
        T: PartialEq,
        R: Value,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.extend(transform(f), sentinel(failed_outcome, None))
    }

    /// Like [`Self::and_then_or`], also failing with `failed_outcome` after `timeout`.
    pub fn and_then_within<R, F>(&self, timeout: Duration, failed_outcome: T, f: F) -> Completes<R>
    where
        T: PartialEq,
        R: Value,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.extend(transform(f), sentinel(failed_outcome, Some(timeout)))
    }

    /// Transforms the outcome with a fallible function.
    ///
    /// An `Err` fails the stage with [`ErrorKind::StageFailed`](crate::ErrorKind::StageFailed).
    pub fn try_and_then<R, E, F>(&self, f: F) -> Completes<R>
    where
        R: Value,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
        F: FnOnce(T) -> std::result::Result<R, E> + Send + 'static,
    {
        let stage = Stage::Map {
            kind: StageKind::Transform,
            f: Box::new(move |v| f(v).map_err(Error::stage_failed)),
        };
        self.extend(stage, StageOptions::none())
    }

    /// Continues with the completion returned by `f`.
    ///
    /// The new stage resolves with whatever the returned completion resolves
    /// with, one level deep.
    pub fn and_then_to<R, F>(&self, f: F) -> Completes<R>
    where
        R: Value,
        F: FnOnce(T) -> Completes<R> + Send + 'static,
    {
        self.extend(flatten(f), StageOptions::none())
    }

    /// Like [`Self::and_then_to`], failing instead when the outcome equals `failed_outcome`.
    pub fn and_then_to_or<R, F>(&self, failed_outcome: T, f: F) -> Completes<R>
    where
        T: PartialEq,
        R: Value,
        F: FnOnce(T) -> Completes<R> + Send + 'static,
    {
        self.extend(flatten(f), sentinel(failed_outcome, None))
    }

    /// Like [`Self::and_then_to_or`], also failing with `failed_outcome` after `timeout`.
    pub fn and_then_to_within<R, F>(
        &self,
        timeout: Duration,
        failed_outcome: T,
        f: F,
    ) -> Completes<R>
    where
        T: PartialEq,
        R: Value,
        F: FnOnce(T) -> Completes<R> + Send + 'static,
    {
        self.extend(flatten(f), sentinel(failed_outcome, Some(timeout)))
    }

    /// Observes the outcome; the stage resolves with the same value.
    pub fn and_then_consume<F>(&self, f: F) -> Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.extend(consume(f), StageOptions::none())
    }

    /// Like [`Self::and_then_consume`], failing instead when the outcome equals `failed_outcome`.
    pub fn and_then_consume_or<F>(&self, failed_outcome: T, f: F) -> Self
    where
        T: PartialEq,
        F: FnOnce(&T) + Send + 'static,
    {
        self.extend(consume(f), sentinel(failed_outcome, None))
    }

    /// Like [`Self::and_then_consume_or`], also failing with `failed_outcome` after `timeout`.
    pub fn and_then_consume_within<F>(&self, timeout: Duration, failed_outcome: T, f: F) -> Self
    where
        T: PartialEq,
        F: FnOnce(&T) + Send + 'static,
    {
        self.extend(consume(f), sentinel(failed_outcome, Some(timeout)))
    }

    // ---------------------------------------------------------------------
    // Failure stages
    // ---------------------------------------------------------------------

    /// Replaces a failure with `f(failed_outcome)`; successes pass through.
    ///
    /// `f` receives `T::default()` when the failure carries no value of
    /// type `T` (a captured error, or a timeout without a fallback).
    pub fn otherwise<F>(&self, f: F) -> Self
    where
        T: Default,
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.extend(otherwise(f), StageOptions::none())
    }

    /// Like [`Self::otherwise`] with its own sentinel and timeout.
    pub fn otherwise_within<F>(&self, timeout: Duration, failed_outcome: T, f: F) -> Self
    where
        T: Default + PartialEq,
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.extend(otherwise(f), sentinel(failed_outcome, Some(timeout)))
    }

    /// Observes a failure; the stage resolves with the failed outcome as its value.
    pub fn otherwise_consume<F>(&self, f: F) -> Self
    where
        T: Default,
        F: FnOnce(&T) + Send + 'static,
    {
        self.extend(
            otherwise(move |v: T| {
                f(&v);
                v
            }),
            StageOptions::none(),
        )
    }

    /// Replaces a captured error with `f(error)`.
    ///
    /// Sentinel and timeout failures are not errors and pass through.
    pub fn recover_from<F>(&self, f: F) -> Self
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.extend(recover(f), StageOptions::none())
    }

    /// Like [`Self::recover_from`] with its own sentinel and timeout.
    pub fn recover_from_within<F>(&self, timeout: Duration, failed_outcome: T, f: F) -> Self
    where
        T: PartialEq,
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.extend(recover(f), sentinel(failed_outcome, Some(timeout)))
    }

    pub(crate) fn settle<R, F>(&self, f: F) -> Completes<R>
    where
        R: Value,
        F: FnOnce(Result<T>) -> R + Send + 'static,
    {
        self.extend(Stage::Settle(Box::new(f)), StageOptions::none())
    }

    // ---------------------------------------------------------------------
    // Consumer side
    // ---------------------------------------------------------------------

    /// Returns true once this stage is resolved.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.node.cell.is_completed()
    }

    /// Returns true if this stage resolved as a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.node.cell.is_failed()
    }

    /// Returns true if any stage of this pipeline has failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.node.pipeline().has_failed()
    }

    /// The stage's current value: its success value, or its failed outcome
    /// when that has type `T`.
    #[must_use]
    pub fn outcome(&self) -> Option<T> {
        self.node.cell.resolution().and_then(Resolution::into_value)
    }

    /// The captured error, if the stage failed with one.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        self.node
            .cell
            .resolution()
            .and_then(|resolution| resolution.error().cloned())
    }

    /// Blocks until this stage resolves or `timeout` elapses.
    ///
    /// Returns true if the stage is resolved.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.node.cell.wait(timeout)
    }

    /// Blocks until this stage resolves and returns [`Self::outcome`],
    /// or `T::default()` when there is none.
    pub fn await_outcome(&self) -> T
    where
        T: Default,
    {
        self.wait(None);
        self.outcome().unwrap_or_default()
    }

    /// Like [`Self::await_outcome`], returning `T::default()` if the stage is
    /// still pending after `timeout`.
    pub fn await_within(&self, timeout: Duration) -> T
    where
        T: Default,
    {
        self.wait(Some(timeout));
        self.outcome().unwrap_or_default()
    }

    /// Blocks until the most recently attached stage of the whole pipeline
    /// resolves and returns its outcome.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::TypeMismatch`](crate::ErrorKind::TypeMismatch) if that
    /// stage does not produce `R`.
    pub fn await_last<R>(&self) -> Result<R>
    where
        R: Value + Default,
    {
        self.last_outcome(None)
    }

    /// Like [`Self::await_last`] with a deadline; yields `R::default()` on expiry.
    ///
    /// # Errors
    ///
    /// See [`Self::await_last`].
    pub fn await_last_within<R>(&self, timeout: Duration) -> Result<R>
    where
        R: Value + Default,
    {
        self.last_outcome(Some(timeout))
    }

    fn last_outcome<R>(&self, timeout: Option<Duration>) -> Result<R>
    where
        R: Value + Default,
    {
        let last = Arc::clone(&*self.tracker.last.lock());
        let found = last.value_type();
        let node = last.into_any().downcast::<Node<R>>().map_err(|_| {
            let err = Error::type_mismatch(type_name::<R>(), found);
            error!(error = %err, "pipeline outcome requested with the wrong type");
            err
        })?;
        node.cell.wait(timeout);
        Ok(node
            .cell
            .resolution()
            .and_then(Resolution::into_value)
            .unwrap_or_default())
    }

    /// The stage's kind.
    #[must_use]
    pub fn kind(&self) -> StageKind {
        self.node.kind()
    }
}

impl<T: Value> Default for Completes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Value> fmt::Debug for Completes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completes")
            .field("stage", &self.node.id())
            .field("kind", &self.node.kind())
            .field("completed", &self.is_completed())
            .field("failed", &self.is_failed())
            .field("pipeline_failed", &self.has_failed())
            .finish()
    }
}

fn sentinel<T: PartialEq>(failed_outcome: T, timeout: Option<Duration>) -> StageOptions<T> {
    StageOptions {
        failed_outcome: Some(FailedOutcome::new(failed_outcome)),
        timeout,
    }
}

fn transform<T, R>(f: impl FnOnce(T) -> R + Send + 'static) -> Stage<T, R> {
    Stage::Map {
        kind: StageKind::Transform,
        f: Box::new(move |v| Ok(f(v))),
    }
}

fn consume<T>(f: impl FnOnce(&T) + Send + 'static) -> Stage<T, T> {
    Stage::Map {
        kind: StageKind::Consume,
        f: Box::new(move |v| {
            f(&v);
            Ok(v)
        }),
    }
}

fn flatten<T, R: Value>(f: impl FnOnce(T) -> Completes<R> + Send + 'static) -> Stage<T, R> {
    Stage::FlatMap(Box::new(move |v| Ok(f(v))))
}

fn otherwise<T: Default>(f: impl FnOnce(T) -> T + Send + 'static) -> Stage<T, T> {
    Stage::Otherwise {
        pass: std::convert::identity,
        replace: Box::new(move |failed: Option<T>| f(failed.unwrap_or_default())),
    }
}

fn recover<T>(f: impl FnOnce(Error) -> T + Send + 'static) -> Stage<T, T> {
    Stage::Recover {
        pass: std::convert::identity,
        recover: Box::new(f),
    }
}
