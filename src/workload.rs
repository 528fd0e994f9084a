//! Synthetic producers driven by the `calltrack` binary
//!
//! - `run_demo`: one worker replaying a short scripted program
//! - `run_stress`: many workers dispatching concurrently while the session is
//!   stopped underneath them

use std::panic;
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use crate::event::{ObjectId, ProducerEvent, RawArg, RawLocation, RawText, RawValue, TranslationError};
use crate::session::{Captured, Delivery, StopReport, TrackError, Tracker};

const FILES: [&str; 3] = ["core.py", "io.py", "util.py"];
const FUNCS: [&str; 4] = ["step", "load", "parse", "emit"];
const TYPES: [&str; 3] = ["dict", "list", "bytes"];

fn captured(report: StopReport) -> Captured {
    report.into_captured().unwrap_or_default()
}

/// Replay a small scripted program in a fresh batched session.
///
/// The script covers nested calls with arguments, an object created in a
/// callee and destroyed in its caller, the destruction of an object created
/// before the session, a raised exception, and a field the producer could not
/// translate.
pub fn run_demo(tracker: &Tracker) -> Result<Captured, TrackError> {
    let mut worker = tracker.register_worker();
    tracker.start(Delivery::Batched)?;

    let script = vec![
        ProducerEvent::call("app.py", 1, "<module>"),
        ProducerEvent::call("app.py", 10, "main"),
        ProducerEvent::Call {
            callee: RawLocation::new("app.py", 20, "build"),
            args: vec![
                RawArg {
                    name: "size".into(),
                    id: 0x1000,
                    type_name: "int".into(),
                },
                RawArg {
                    name: RawText::Untranslatable(TranslationError::new(
                        "UnicodeEncodeError",
                        "surrogates not allowed",
                    )),
                    id: 0x1008,
                    type_name: "str".into(),
                },
            ],
        },
        ProducerEvent::create(0x2000, "dict"),
        ProducerEvent::Return {
            value: Some(RawValue {
                id: 0x2000,
                type_name: "dict".into(),
            }),
            raised: false,
        },
        ProducerEvent::destroy(0x2000, "dict"),
        ProducerEvent::destroy(0x3000, "list"),
        ProducerEvent::call("app.py", 30, "fail"),
        ProducerEvent::Return {
            value: None,
            raised: true,
        },
        ProducerEvent::ret(),
        ProducerEvent::ret(),
    ];
    for event in script {
        tracker.dispatch(&mut worker, event);
    }

    Ok(captured(tracker.stop()?))
}

/// Parameters of a stress run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressConfig {
    pub threads: usize,
    pub events_per_thread: usize,
    /// Delay after start before the session is stopped
    pub stop_after: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            events_per_thread: 1000,
            stop_after: Duration::from_millis(5),
        }
    }
}

/// Result of a stress run.
#[derive(Debug)]
pub struct StressOutcome {
    /// Dispatches that returned `Recorded`
    pub accepted: usize,
    /// Dispatches refused because the session had stopped
    pub rejected: usize,
    pub elapsed: Duration,
    pub captured: Captured,
}

impl StressOutcome {
    /// Every accepted dispatch is in the log and nothing else is.
    pub fn is_consistent(&self) -> bool {
        self.accepted == self.captured.records.len()
    }
}

/// Event number `i` of worker `t`: call, create, destroy, return.
fn stress_event(t: usize, i: usize) -> ProducerEvent<'static> {
    let id: ObjectId = ((t as u64) << 40) | (i as u64 / 4);
    match i % 4 {
        0 => ProducerEvent::Call {
            callee: RawLocation::new(FILES[t % FILES.len()], (i % 500) as i32, FUNCS[i % FUNCS.len()]),
            args: vec![RawArg {
                name: "n".into(),
                id,
                type_name: "int".into(),
            }],
        },
        1 => ProducerEvent::create(id, TYPES[i % TYPES.len()]),
        2 => ProducerEvent::destroy(id, TYPES[(i - 1) % TYPES.len()]),
        _ => ProducerEvent::ret(),
    }
}

/// Dispatch from `config.threads` workers at once and stop the session after
/// `config.stop_after`, while they may still be running.
pub fn run_stress(tracker: &Tracker, config: &StressConfig) -> Result<StressOutcome, TrackError> {
    tracker.start(Delivery::Batched)?;
    let started = Instant::now();

    let (report, counts) = thread::scope(|scope| {
        let producers: Vec<_> = (0..config.threads)
            .map(|t| {
                scope.spawn(move || {
                    let mut worker = tracker.register_worker();
                    let (mut accepted, mut rejected) = (0usize, 0usize);
                    for i in 0..config.events_per_thread {
                        if tracker.dispatch(&mut worker, stress_event(t, i)).is_accepted() {
                            accepted += 1;
                        } else {
                            rejected += 1;
                        }
                    }
                    (accepted, rejected)
                })
            })
            .collect();

        thread::sleep(config.stop_after);
        let report = tracker.stop();

        let counts: Vec<(usize, usize)> = producers.into_iter().map(join_producer).collect();
        (report, counts)
    });

    let captured = captured(report?);
    let (accepted, rejected) = counts
        .iter()
        .fold((0, 0), |(a, r), (pa, pr)| (a + pa, r + pr));

    tracing::debug!(
        threads = config.threads,
        accepted,
        rejected,
        recorded = captured.records.len(),
        "stress run finished"
    );

    Ok(StressOutcome {
        accepted,
        rejected,
        elapsed: started.elapsed(),
        captured,
    })
}

/// Join a producer, re-raising its panic so its counts are never guessed.
fn join_producer<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload))
}
