//! Error types for deferred outcomes and the timer scheduler.
//!
//! A failure captured by one stage must be replayable by every stage that
//! short-circuits behind it, so [`Error`] is cheaply cloneable: its message
//! is owned and its source chain lives behind an `Arc`.
//!
//! # Kinds
//!
//! | Kind | Raised when |
//! |------|-------------|
//! | `Panicked` | a stage or callback panicked; message is the panic payload |
//! | `StageFailed` | a fallible stage returned `Err` |
//! | `FailedOutcome` | a sentinel or timeout failure is converted into an error |
//! | `TypeMismatch` | a payload or pipeline value had an unexpected type |
//! | `NoScheduler` | a timeout was requested on a pipeline without a scheduler |
//! | `SchedulerClosed` | work was submitted to a closed scheduler |

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A user closure panicked.
    Panicked,
    /// A fallible stage returned an error.
    StageFailed,
    /// A failed outcome (sentinel or timeout fallback) surfaced as an error.
    FailedOutcome,
    /// A value did not have the type the consumer asked for.
    TypeMismatch,
    /// A timeout needs a scheduler but the pipeline has none.
    NoScheduler,
    /// The scheduler has been closed.
    SchedulerClosed,
}

impl ErrorKind {
    /// Returns a short, stable label suitable for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Panicked => "panicked",
            Self::StageFailed => "stage_failed",
            Self::FailedOutcome => "failed_outcome",
            Self::TypeMismatch => "type_mismatch",
            Self::NoScheduler => "no_scheduler",
            Self::SchedulerClosed => "scheduler_closed",
        }
    }

    /// Returns true if the error originated in user code rather than in the crate.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(
            self,
            Self::Panicked | Self::StageFailed | Self::FailedOutcome
        )
    }
}

/// The main error type.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error captures a panic.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        matches!(self.kind, ErrorKind::Panicked)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates an error from a caught panic payload.
    #[must_use]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        Self::new(ErrorKind::Panicked).with_message(payload_to_string(payload))
    }

    /// Wraps an error returned by a fallible stage.
    #[must_use]
    pub fn stage_failed(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        let source: Box<dyn std::error::Error + Send + Sync> = source.into();
        let message = source.to_string();
        Self {
            kind: ErrorKind::StageFailed,
            message: Some(message),
            source: Some(Arc::from(source)),
        }
    }

    /// Reports that a value of type `found` was seen where `expected` was required.
    #[must_use]
    pub fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        Self::new(ErrorKind::TypeMismatch)
            .with_message(format!("expected {expected}, found {found}"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Renders a panic payload as text.
///
/// Panics raised with `panic!("...")` carry either a `&'static str` or a
/// `String`; anything else is reported generically.
pub(crate) fn payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
