//! Calltrack - call and object lifecycle tracking for a running program
//!
//! A host engine reports function calls, returns, object creations and
//! destructions through [`session::Tracker::dispatch`]. The tracker builds
//! self-contained records, correlates each destruction with the context in
//! which the object was created, and hands everything to the consumer either
//! synchronously through a callback or in one batch at stop.
//!
//! Starting and stopping are safe while producers are running on other
//! threads: [`barrier::StopBarrier`] guarantees that once `stop` returns, no
//! producer is still touching the session's resources.

pub mod barrier;
pub mod cli;
pub mod config;
pub mod context;
pub mod correlation;
pub mod encode;
pub mod event;
pub mod event_log;
pub mod frame_stack;
pub mod interning;
pub mod invariant;
pub mod session;
pub mod workload;
