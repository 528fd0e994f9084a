//! Fail-first invariant checking
//!
//! Resource exhaustion and caller contract violations inside the tracking
//! core are not recoverable: continuing would mean silently losing telemetry.
//! These helpers log the violated condition with its source location and
//! abort the process immediately.
//!
//! Recoverable conditions (a field that cannot be translated, an encoder that
//! fails on one record) never go through this module; they are captured as
//! data on the owning record or in the output error list.

use std::collections::TryReserveError;
use std::panic::Location;

/// Abort the process with diagnostic context.
///
/// `message` describes the violated invariant, `condition` is the source text
/// of the failed check. The caller's location is reported via `#[track_caller]`.
#[cold]
#[track_caller]
pub fn fatal(message: &str, condition: &str) -> ! {
    let location = Location::caller();
    tracing::error!(
        reason = message,
        condition,
        file = location.file(),
        line = location.line(),
        "invariant violated"
    );
    eprintln!(
        "INVARIANT VIOLATED: {}\n  condition: {}\n  at {}:{}",
        message,
        condition,
        location.file(),
        location.line()
    );
    std::process::abort()
}

/// Abort on a failed allocation while growing a tracking structure.
#[cold]
#[track_caller]
pub fn allocation_failed(what: &str, err: &TryReserveError) -> ! {
    fatal(&format!("{what} allocation failed: {err}"), "try_reserve")
}

/// Precondition check: abort if `cond` is false.
///
/// ```
/// use calltrack::require;
///
/// let depth = 1;
/// require!(depth > 0, "stack underflow");
/// ```
#[macro_export]
macro_rules! require {
    ($cond:expr, $msg:expr $(,)?) => {
        if !$cond {
            $crate::invariant::fatal($msg, stringify!($cond));
        }
    };
}
