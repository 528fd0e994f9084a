//! Per-worker call stack
//!
//! Each producer thread owns a [`Worker`], which owns a [`FrameStack`] of
//! interned locations. The stack reconstructs caller chains for call events
//! and creation backtraces. It is never shared, so it needs no locking.
//!
//! Depth is unbounded: the stack doubles on demand and its size is governed
//! only by the recursion depth of the instrumented program.

use crate::context::{self, WorkerId};
use crate::event::Location;
use crate::invariant;

/// Capacity of the first allocation.
pub const INITIAL_CAPACITY: usize = 64;

/// Growth factor applied when the stack is full.
const GROWTH_FACTOR: usize = 2;

/// Stack of active frames, innermost on top.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: Vec<Location>,
}

impl FrameStack {
    /// Create an empty stack. Nothing is allocated until the first push.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_capacity(&mut self) {
        let len = self.frames.len();
        if len < self.frames.capacity() {
            return;
        }
        let target = if self.frames.capacity() == 0 {
            INITIAL_CAPACITY
        } else {
            match self.frames.capacity().checked_mul(GROWTH_FACTOR) {
                Some(target) => target,
                None => invariant::fatal("frame stack capacity overflow", "capacity * GROWTH_FACTOR"),
            }
        };
        if let Err(err) = self.frames.try_reserve_exact(target - len) {
            invariant::allocation_failed("frame stack", &err);
        }
    }

    /// Push a frame.
    pub fn push(&mut self, frame: Location) {
        self.ensure_capacity();
        self.frames.push(frame);
    }

    /// Pop the innermost frame.
    ///
    /// Aborts on an empty stack: every pop must match an earlier push.
    pub fn pop(&mut self) -> Location {
        match self.frames.pop() {
            Some(frame) => frame,
            None => invariant::fatal("frame stack underflow", "depth > 0"),
        }
    }

    /// Innermost frame.
    pub fn top(&self) -> Option<&Location> {
        self.frames.last()
    }

    /// Frame directly below the top, or `None` if depth < 2.
    pub fn caller(&self) -> Option<&Location> {
        let depth = self.frames.len();
        if depth < 2 {
            return None;
        }
        self.frames.get(depth - 2)
    }

    /// Copy of up to `max` frames, innermost first.
    pub fn backtrace(&self, max: usize) -> Vec<Location> {
        self.frames.iter().rev().take(max).cloned().collect()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// Reset depth to zero, keeping the allocation for reuse.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Reset depth to zero and release the allocation.
    pub fn destroy(&mut self) {
        self.frames = Vec::new();
    }
}

/// Explicit per-worker producer context.
///
/// Obtained from [`Tracker::register_worker`](crate::session::Tracker::register_worker)
/// and passed by `&mut` to every dispatch made from that worker. The worker
/// remembers which session epoch its stack belongs to; when a new session
/// starts, the stack is cleared before the worker's next protected access.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    epoch: u64,
    frames: FrameStack,
}

impl Worker {
    /// New worker with a process-unique id.
    pub fn new() -> Self {
        Self {
            id: context::next_worker_id(),
            epoch: 0,
            frames: FrameStack::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameStack {
        &mut self.frames
    }

    /// Bind the worker to session `epoch`, clearing a stack left over from an
    /// earlier session.
    pub(crate) fn enter_epoch(&mut self, epoch: u64) {
        if self.epoch != epoch {
            if !self.frames.is_empty() {
                tracing::debug!(
                    worker = self.id,
                    stale_depth = self.frames.depth(),
                    "clearing frame stack from previous session"
                );
            }
            self.frames.clear();
            self.epoch = epoch;
        }
    }

    /// Clear the frame stack, keeping its allocation.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Release the frame stack allocation (worker teardown).
    pub fn destroy(&mut self) {
        self.frames.destroy();
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}
