//! Stage kinds, resolutions and failure causes.
//!
//! A stage is a closed set of continuation shapes. Each shape decides what
//! happens on the success branch and on the failure branch of its antecedent:
//!
//! | Stage | On success | On failure |
//! |-------|------------|------------|
//! | `Map` (transform, consume) | run `f` | short-circuit |
//! | `FlatMap` | run `f`, follow the returned completion | short-circuit |
//! | `Otherwise` | pass value through | run `replace` with the failed value |
//! | `Recover` | pass value through | run `recover` on errors, short-circuit sentinels |
//! | `Settle` | run `f(Ok(v))` | run `f(Err(e))` |
//!
//! Every user closure runs under `catch_unwind`; a panic becomes an
//! [`ErrorKind::Panicked`] failure of the stage that ran it.

use std::any::{type_name, Any};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::{Completes, Value};
use crate::error::{Error, ErrorKind, Result};
use crate::tracing_compat::error;

/// A type-erased failed-outcome value travelling with a failure.
#[derive(Clone)]
pub(crate) struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    pub(crate) fn new<T: Value>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub(crate) fn downcast<T: Value>(&self) -> Option<T> {
        self.value.downcast_ref::<T>().cloned()
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload").field(&self.type_name).finish()
    }
}

/// Why a stage failed.
#[derive(Debug, Clone)]
pub(crate) enum Cause {
    /// A failed-outcome sentinel matched, or a timeout fired.
    Outcome(Option<Payload>),
    /// A closure panicked or returned an error.
    Error(Error),
}

impl Cause {
    /// The failed value as `T`.
    ///
    /// `Ok(None)` when there is no value to hand over; an error when a value
    /// exists but has a different type.
    pub(crate) fn payload_as<T: Value>(&self) -> Result<Option<T>> {
        match self {
            Self::Outcome(Some(payload)) => payload
                .downcast::<T>()
                .map(Some)
                .ok_or_else(|| Error::type_mismatch(type_name::<T>(), payload.type_name())),
            Self::Outcome(None) | Self::Error(_) => Ok(None),
        }
    }

    pub(crate) fn to_error(&self) -> Error {
        match self {
            Self::Error(err) => err.clone(),
            Self::Outcome(Some(payload)) => Error::new(ErrorKind::FailedOutcome)
                .with_message(format!("failed outcome of type {}", payload.type_name())),
            Self::Outcome(None) => {
                Error::new(ErrorKind::FailedOutcome).with_message("timed out without a fallback")
            }
        }
    }
}

/// Terminal state of a stage.
#[derive(Debug, Clone)]
pub(crate) enum Resolution<T> {
    Succeeded(T),
    Failed {
        /// The failed value when it has this stage's type.
        value: Option<T>,
        cause: Cause,
    },
}

impl<T> Resolution<T> {
    pub(crate) fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub(crate) fn value(&self) -> Option<&T> {
        match self {
            Self::Succeeded(v) => Some(v),
            Self::Failed { value, .. } => value.as_ref(),
        }
    }

    pub(crate) fn into_value(self) -> Option<T> {
        match self {
            Self::Succeeded(v) => Some(v),
            Self::Failed { value, .. } => value,
        }
    }

    pub(crate) fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed {
                cause: Cause::Error(err),
                ..
            } => Some(err),
            _ => None,
        }
    }

    pub(crate) fn from_error(err: Error) -> Self {
        Self::Failed {
            value: None,
            cause: Cause::Error(err),
        }
    }
}

impl<T: Value> Resolution<T> {
    /// Failure carrying `value` as its failed outcome.
    pub(crate) fn failed_outcome(value: T) -> Self {
        Self::Failed {
            value: Some(value.clone()),
            cause: Cause::Outcome(Some(Payload::new(value))),
        }
    }

    /// Failure propagated unchanged from an upstream stage.
    pub(crate) fn inherit(cause: &Cause) -> Self {
        let value = match cause {
            Cause::Outcome(Some(payload)) => payload.downcast::<T>(),
            _ => None,
        };
        Self::Failed {
            value,
            cause: cause.clone(),
        }
    }
}

fn settle<R>(result: Result<R>) -> Resolution<R> {
    match result {
        Ok(v) => Resolution::Succeeded(v),
        Err(err) => Resolution::from_error(err),
    }
}

/// Runs user code, converting a panic into an error.
pub(crate) fn guarded<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(Error::panicked(payload.as_ref())))
}

/// Sentinel value: an antecedent outcome equal to it counts as a failure.
#[derive(Clone)]
pub(crate) struct FailedOutcome<T> {
    value: T,
    eq: fn(&T, &T) -> bool,
}

impl<T: PartialEq> FailedOutcome<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value,
            eq: PartialEq::eq,
        }
    }
}

impl<T> FailedOutcome<T> {
    pub(crate) fn matches(&self, outcome: &T) -> bool {
        (self.eq)(&self.value, outcome)
    }

    pub(crate) fn value(&self) -> &T {
        &self.value
    }
}

/// Per-stage options: failed-outcome sentinel and timeout.
pub(crate) struct StageOptions<T> {
    pub(crate) failed_outcome: Option<FailedOutcome<T>>,
    pub(crate) timeout: Option<Duration>,
}

impl<T> StageOptions<T> {
    pub(crate) fn none() -> Self {
        Self {
            failed_outcome: None,
            timeout: None,
        }
    }

    /// Explicit options win over `self`, field by field.
    pub(crate) fn overridden_by(self, explicit: Self) -> Self {
        Self {
            failed_outcome: explicit.failed_outcome.or(self.failed_outcome),
            timeout: explicit.timeout.or(self.timeout),
        }
    }
}

impl<T: Clone> Clone for StageOptions<T> {
    fn clone(&self) -> Self {
        Self {
            failed_outcome: self.failed_outcome.clone(),
            timeout: self.timeout,
        }
    }
}

/// Which public operation created a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Pipeline root.
    Root,
    /// `and_then` / `try_and_then`.
    Transform,
    /// `and_then_consume`.
    Consume,
    /// `and_then_to`.
    Flatten,
    /// `otherwise` / `otherwise_consume`.
    Otherwise,
    /// `recover_from`.
    Recover,
    /// Outcome algebra bridge.
    Settle,
}

impl StageKind {
    /// Returns a short label for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Transform => "transform",
            Self::Consume => "consume",
            Self::Flatten => "flatten",
            Self::Otherwise => "otherwise",
            Self::Recover => "recover",
            Self::Settle => "settle",
        }
    }
}

type MapFn<T, R> = Box<dyn FnOnce(T) -> Result<R> + Send>;

pub(crate) enum Stage<T, R> {
    Map { kind: StageKind, f: MapFn<T, R> },
    FlatMap(Box<dyn FnOnce(T) -> Result<Completes<R>> + Send>),
    Otherwise {
        pass: fn(T) -> R,
        replace: Box<dyn FnOnce(Option<T>) -> R + Send>,
    },
    Recover {
        pass: fn(T) -> R,
        recover: Box<dyn FnOnce(Error) -> R + Send>,
    },
    Settle(Box<dyn FnOnce(Result<T>) -> R + Send>),
}

/// What a stage produced for a successful antecedent.
pub(crate) enum Step<R> {
    Resolve(Resolution<R>),
    Follow(Completes<R>),
}

impl<T: Value, R: Value> Stage<T, R> {
    pub(crate) fn kind(&self) -> StageKind {
        match self {
            Self::Map { kind, .. } => *kind,
            Self::FlatMap(_) => StageKind::Flatten,
            Self::Otherwise { .. } => StageKind::Otherwise,
            Self::Recover { .. } => StageKind::Recover,
            Self::Settle(_) => StageKind::Settle,
        }
    }

    pub(crate) fn on_success(self, value: T) -> Step<R> {
        match self {
            Self::Map { f, .. } => Step::Resolve(settle(guarded(|| f(value)))),
            Self::FlatMap(f) => match guarded(|| f(value)) {
                Ok(inner) => Step::Follow(inner),
                Err(err) => Step::Resolve(Resolution::from_error(err)),
            },
            Self::Otherwise { pass, .. } | Self::Recover { pass, .. } => {
                Step::Resolve(Resolution::Succeeded(pass(value)))
            }
            Self::Settle(f) => Step::Resolve(settle(guarded(|| Ok(f(Ok(value)))))),
        }
    }

    pub(crate) fn on_failure(self, value: Option<&T>, cause: &Cause) -> Resolution<R> {
        match self {
            Self::Map { .. } | Self::FlatMap(_) => Resolution::inherit(cause),
            Self::Otherwise { replace, .. } => {
                let input = match value {
                    Some(v) => Ok(Some(v.clone())),
                    None => cause.payload_as::<T>(),
                };
                match input {
                    Ok(input) => settle(guarded(|| Ok(replace(input)))),
                    Err(err) => {
                        error!(error = %err, "failed outcome cannot be handed to otherwise");
                        Resolution::from_error(err)
                    }
                }
            }
            Self::Recover { recover, .. } => match cause {
                Cause::Error(err) => {
                    let err = err.clone();
                    settle(guarded(|| Ok(recover(err))))
                }
                Cause::Outcome(_) => Resolution::inherit(cause),
            },
            Self::Settle(f) => {
                let err = cause.to_error();
                settle(guarded(|| Ok(f(Err(err)))))
            }
        }
    }
}
