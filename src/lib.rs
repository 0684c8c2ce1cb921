//! Completes: deferred outcomes with chained continuations and a timer scheduler.
//!
//! # Overview
//!
//! A [`Completes<T>`] stands for a value that will be delivered later. Callers
//! attach continuations (`and_then`, `and_then_to`, `and_then_consume`,
//! `otherwise`, `recover_from`) that run when the value arrives. Each stage may
//! carry a failed-outcome sentinel and a timeout; timeouts are driven by a
//! [`Scheduler`].
//!
//! # Core Guarantees
//!
//! - **Single assignment**: a stage resolves at most once; later deliveries are ignored
//! - **Ordered continuations**: continuations attached to one stage run in attachment order
//! - **Short circuit**: forward stages skip their closure once the pipeline has failed
//! - **Sticky failure**: [`Completes::has_failed`] stays true after a later stage recovers
//! - **Contained panics**: a panicking closure fails its stage instead of unwinding the producer
//!
//! # Module Structure
//!
//! - [`completes`]: Deferred outcomes, stages, the repeating mode and [`invert`]
//! - [`scheduler`]: One-shot and repeating timers with cancellation
//! - [`error`]: Error types
//! - [`tracing_compat`]: Logging macros that compile away without `tracing-integration`

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod completes;
pub mod error;
pub mod scheduler;
pub mod tracing_compat;

#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use completes::{invert, Armed, Completes, Repeating, StageKind, Value};
pub use error::{Error, ErrorKind, Result};
pub use scheduler::{
    CancelHandle, ConfigError, Scheduled, Scheduler, SchedulerConfig, SchedulerHandle, TaskId,
};
