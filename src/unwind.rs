//! Panic containment for callback boundaries.
//!
//! Profiling hooks and the between-jobs callback run on runtime-internal
//! threads; a panic escaping one of them must not take the worker down.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

/// Executes `func` and captures any panic, translating it into an `Err`
/// result. Callers that swallow the error must be prepared to observe
/// partial side effects from `func`.
pub(crate) fn halt_unwinding<F, R>(func: F) -> thread::Result<R>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(func))
}
