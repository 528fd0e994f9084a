//! Execution context stamped on every event record
//!
//! - `timestamp_ns()`: monotonic nanoseconds since the first call in this process
//! - `next_worker_id()`: process-unique identifier for a producer worker
//!
//! Both are lock-free and safe to call from any thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();
static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

/// Identifier of a producer worker (one per registered `Worker`).
pub type WorkerId = u64;

/// Monotonic timestamp in nanoseconds.
///
/// Successive calls on one thread never go backwards. The origin is the first
/// call made in this process, so values are only comparable within a process.
pub fn timestamp_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Allocate a fresh worker identifier. Never returns 0.
pub fn next_worker_id() -> WorkerId {
    NEXT_WORKER.fetch_add(1, Ordering::Relaxed)
}
