//! Outcome algebra bridge.
//!
//! Turns "a result that may hold a deferred value" into "a deferred result":
//!
//! | Input | Output |
//! |-------|--------|
//! | `Err(cause)` | completion already resolved with `Err(cause)` |
//! | `Ok(c)`, `c` succeeds with `v` | resolves with `Ok(v)` |
//! | `Ok(c)`, `c` fails | resolves with `Err(E::from(error))` |
//!
//! The output of the `Ok` case is a stage of `c`'s pipeline, so it shares
//! `c`'s scheduler and [`Completes::has_failed`] flag.

use super::{Completes, Value};
use crate::error::Error;

/// Inverts `Result<Completes<T>, E>` into `Completes<Result<T, E>>`.
///
/// Sentinel and timeout failures of the inner completion surface as an
/// [`ErrorKind::FailedOutcome`](crate::ErrorKind::FailedOutcome) error.
pub fn invert<T, E>(outcome: Result<Completes<T>, E>) -> Completes<Result<T, E>>
where
    T: Value,
    E: From<Error> + Value,
{
    match outcome {
        Err(cause) => Completes::with_success(Err(cause)),
        Ok(inner) => inner.settle(|result: crate::Result<T>| result.map_err(E::from)),
    }
}
