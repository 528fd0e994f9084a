//! Stop barrier for safe termination of in-flight producers
//!
//! Every producer-side access to session resources runs inside a protected
//! section of a [`StopBarrier`]. Stopping refuses new sections, then blocks
//! until the sections already running have left. Once [`StopBarrier::stop`]
//! returns `Ok`, nothing can still be touching the resources it guards.
//!
//! # Protocol
//!
//! ```text
//! try_enter:  state live? ─ no ─> false
//!             stopping?   ─ yes ─> false
//!             in_flight += 1
//!             stopping?   ─ yes ─> in_flight -= 1 (wake stopper at 0), false
//!             depth[thread] += 1, true
//!
//! stop:       depth[thread] > 0 ─> FromInsideProtectedSection
//!             stopping = true
//!             wait until in_flight == 0
//! ```
//!
//! The flag store in `stop` and the counter increment in `try_enter` are each
//! followed by a load of the other variable. Both pairs are `SeqCst` so at
//! least one side observes the other.
//!
//! # States
//!
//! ```text
//! [Uninitialized] --init--> [Active] --stop--> [Stopping] --destroy--> [Destroyed]
//!        ^                                                                  |
//!        +----------------------------- init ------------------------------+
//! ```
//!
//! Nesting depth is tracked per thread and per generation (one
//! init-to-destroy epoch), separately from the global counter, so recursive
//! entry on one thread works and that thread's own `stop` is refused instead
//! of deadlocking.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use fnv::FnvHashMap;

use crate::invariant;

const UNINITIALIZED: u8 = 0;
const LIVE: u8 = 1;
const DESTROYED: u8 = 2;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Protected-section depth of the current thread, keyed by barrier generation
    static DEPTHS: RefCell<FnvHashMap<u64, usize>> = RefCell::new(FnvHashMap::default());
}

fn depth_of(generation: u64) -> usize {
    DEPTHS.with(|d| d.borrow().get(&generation).copied().unwrap_or(0))
}

fn increment_depth(generation: u64) {
    DEPTHS.with(|d| *d.borrow_mut().entry(generation).or_insert(0) += 1);
}

/// Returns `false` if the thread had no open section for `generation`.
fn decrement_depth(generation: u64) -> bool {
    DEPTHS.with(|d| {
        let mut depths = d.borrow_mut();
        match depths.get_mut(&generation) {
            Some(depth) if *depth > 1 => {
                *depth -= 1;
                true
            }
            Some(_) => {
                depths.remove(&generation);
                true
            }
            None => false,
        }
    })
}

/// Observable barrier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Uninitialized,
    Active,
    Stopping,
    Destroyed,
}

/// Result of [`StopBarrier::stop`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No protected section is running and none can start
    Ok,
    /// The calling thread is itself inside a protected section; waiting would
    /// deadlock. Nothing was changed.
    FromInsideProtectedSection,
}

/// Reference-counted gate with a waitable drain.
#[derive(Debug)]
pub struct StopBarrier {
    state: AtomicU8,
    stopping: AtomicBool,
    generation: AtomicU64,
    in_flight: CachePadded<AtomicUsize>,
    lock: Mutex<()>,
    drained: Condvar,
}

impl StopBarrier {
    /// Create an uninitialized barrier. [`init`](Self::init) must be called
    /// before any section can be entered.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            stopping: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Activate the barrier for a new generation.
    ///
    /// No-op while the barrier is live (active or stopping).
    pub fn init(&self) {
        let _guard = self.lock();
        if self.state.load(Ordering::Acquire) == LIVE {
            return;
        }
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        self.generation.store(generation, Ordering::Release);
        self.stopping.store(false, Ordering::SeqCst);
        self.state.store(LIVE, Ordering::Release);
        tracing::debug!(generation, "stop barrier initialized");
    }

    /// Release the barrier after a successful [`stop`](Self::stop).
    ///
    /// Idempotent. Aborts if the barrier is live and was never stopped.
    pub fn destroy(&self) {
        let _guard = self.lock();
        if self.state.load(Ordering::Acquire) == LIVE {
            crate::require!(self.stopping.load(Ordering::SeqCst), "barrier destroyed before stop");
            self.state.store(DESTROYED, Ordering::Release);
            tracing::debug!(generation = self.generation.load(Ordering::Acquire), "stop barrier destroyed");
        }
    }

    /// Enter a protected section, returning the generation entered.
    fn enter_generation(&self) -> Option<u64> {
        if self.state.load(Ordering::Acquire) != LIVE {
            return None;
        }
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);

        // stop() may have set the flag between the check above and the increment
        if self.stopping.load(Ordering::SeqCst) {
            self.release_slot();
            return None;
        }

        let generation = self.generation.load(Ordering::Acquire);
        increment_depth(generation);
        Some(generation)
    }

    fn release_slot(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            invariant::fatal("barrier in-flight counter underflow", "in_flight > 0");
        }
        if prev == 1 && self.stopping.load(Ordering::SeqCst) {
            // Taking the lock orders this wake-up after the stopper's check.
            let _guard = self.lock();
            self.drained.notify_all();
        }
    }

    fn leave_generation(&self, generation: u64) {
        if self.state.load(Ordering::Acquire) != LIVE
            || self.generation.load(Ordering::Acquire) != generation
        {
            // Late leave after destroy: only the thread-local bookkeeping remains.
            decrement_depth(generation);
            return;
        }
        if !decrement_depth(generation) {
            invariant::fatal("barrier leave without matching enter", "depth > 0");
        }
        self.release_slot();
    }

    /// Try to enter a protected section.
    ///
    /// Returns `false` if the barrier is not active or a stop has begun.
    /// A `true` result must be paired with exactly one [`leave`](Self::leave)
    /// on the same thread.
    #[must_use]
    pub fn try_enter(&self) -> bool {
        self.enter_generation().is_some()
    }

    /// Leave a protected section entered with [`try_enter`](Self::try_enter).
    ///
    /// No-op once the barrier has been destroyed. Aborts if this thread has no
    /// open section.
    pub fn leave(&self) {
        if self.state.load(Ordering::Acquire) != LIVE {
            return;
        }
        self.leave_generation(self.generation.load(Ordering::Acquire));
    }

    /// Enter a protected section that closes when the guard drops.
    pub fn enter(&self) -> Option<BarrierGuard<'_>> {
        self.enter_generation().map(|generation| BarrierGuard {
            barrier: self,
            generation,
            _not_send: PhantomData,
        })
    }

    /// Run `f` inside a protected section. Returns `None` without running `f`
    /// if the section could not be entered.
    pub fn dispatch<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.enter()?;
        Some(f())
    }

    /// Refuse new sections and wait for running ones to finish.
    ///
    /// Idempotent, and `Ok` on a barrier that is not live. Concurrent callers
    /// all return only after the drain has completed.
    pub fn stop(&self) -> StopOutcome {
        if self.in_protected_section() {
            return StopOutcome::FromInsideProtectedSection;
        }
        if self.state.load(Ordering::Acquire) != LIVE {
            return StopOutcome::Ok;
        }

        let guard = self.lock();
        if !self.stopping.swap(true, Ordering::SeqCst) {
            tracing::debug!(in_flight = self.active_count(), "stop barrier draining");
        }
        let _guard = self
            .drained
            .wait_while(guard, |_| self.in_flight.load(Ordering::SeqCst) > 0)
            .unwrap_or_else(PoisonError::into_inner);
        StopOutcome::Ok
    }

    /// Whether a stop has begun on the live barrier.
    pub fn is_stopping(&self) -> bool {
        self.state.load(Ordering::Acquire) == LIVE && self.stopping.load(Ordering::SeqCst)
    }

    /// Number of sections currently between enter and leave, on all threads.
    pub fn active_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether the calling thread holds an open section of this barrier.
    pub fn in_protected_section(&self) -> bool {
        self.state.load(Ordering::Acquire) == LIVE && depth_of(self.generation.load(Ordering::Acquire)) > 0
    }

    pub fn state(&self) -> BarrierState {
        match self.state.load(Ordering::Acquire) {
            LIVE if self.stopping.load(Ordering::SeqCst) => BarrierState::Stopping,
            LIVE => BarrierState::Active,
            DESTROYED => BarrierState::Destroyed,
            _ => BarrierState::Uninitialized,
        }
    }
}

impl Default for StopBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Open protected section; leaves the barrier on drop.
///
/// Bound to the thread that entered, so it is neither `Send` nor `Sync`.
#[must_use = "the section closes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct BarrierGuard<'a> {
    barrier: &'a StopBarrier,
    generation: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        self.barrier.leave_generation(self.generation);
    }
}
