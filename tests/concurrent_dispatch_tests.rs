//! Concurrent producers against a stopping session
//!
//! Every dispatch that reports `Recorded` must be in the captured log, every
//! record in the log must come from such a dispatch, and nothing may be
//! recorded once `stop()` has returned.

use calltrack::event::{EventKind, EventRecord, ProducerEvent};
use calltrack::session::{Delivery, Dispatched, StopReport, Tracker};
use calltrack::workload::{self, StressConfig};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_stop_race_accepted_equals_recorded() {
    for round in 0..5 {
        let tracker = Arc::new(Tracker::default());
        tracker.start(Delivery::Batched).unwrap();
        let stopped = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..8u64)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                let stopped = Arc::clone(&stopped);
                let late = Arc::clone(&late);
                thread::spawn(move || {
                    let mut worker = tracker.register_worker();
                    let mut accepted = Vec::new();
                    for i in 0..1000u64 {
                        let was_stopped = stopped.load(Ordering::SeqCst);
                        let id = (t << 32) | i;
                        if let Dispatched::Recorded(index) =
                            tracker.dispatch(&mut worker, ProducerEvent::create(id, "obj"))
                        {
                            if was_stopped {
                                late.fetch_add(1, Ordering::SeqCst);
                            }
                            accepted.push((index, id));
                        }
                    }
                    accepted
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(round));
        let report = tracker.stop().unwrap();
        stopped.store(true, Ordering::SeqCst);

        let accepted: Vec<(usize, u64)> = producers
            .into_iter()
            .flat_map(|p| p.join().unwrap())
            .collect();
        let StopReport::Stopped(captured) = report else {
            panic!("expected a captured session");
        };

        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert_eq!(accepted.len(), captured.records.len());
        for (index, id) in &accepted {
            assert_eq!(captured.records[*index].object_id(), Some(*id));
        }
        let distinct: HashSet<u64> = captured.records.iter().filter_map(EventRecord::object_id).collect();
        assert_eq!(distinct.len(), captured.records.len());
    }
}

#[test]
fn test_all_events_recorded_without_stop_race() {
    let tracker = Arc::new(Tracker::default());
    tracker.start(Delivery::Batched).unwrap();

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let mut worker = tracker.register_worker();
                for i in 0..1000 {
                    tracker.dispatch(&mut worker, ProducerEvent::call("w.py", i, "work"));
                    tracker.dispatch(&mut worker, ProducerEvent::ret());
                }
                worker.frames().depth()
            })
        })
        .collect();

    for p in producers {
        assert_eq!(p.join().unwrap(), 0);
    }
    let captured = tracker.stop().unwrap().into_captured().unwrap();
    assert_eq!(captured.records.len(), 16_000);
    // two strings shared by every worker
    assert_eq!(captured.interned_strings, 2);

    let calls = captured.records.iter().filter(|r| r.kind() == EventKind::Call).count();
    assert_eq!(calls, 8_000);
}

#[test]
fn test_creation_correlation_across_threads() {
    let tracker = Arc::new(Tracker::default());
    tracker.start(Delivery::Batched).unwrap();

    // created on one set of workers, destroyed on another
    let ids: Vec<u64> = (0..4000).collect();
    thread::scope(|scope| {
        for chunk in ids.chunks(1000) {
            let tracker = &tracker;
            scope.spawn(move || {
                let mut worker = tracker.register_worker();
                tracker.dispatch(&mut worker, ProducerEvent::call("make.py", 1, "make"));
                for id in chunk {
                    tracker.dispatch(&mut worker, ProducerEvent::create(*id, "node"));
                }
            });
        }
    });
    thread::scope(|scope| {
        for chunk in ids.chunks(1000) {
            let tracker = &tracker;
            scope.spawn(move || {
                let mut worker = tracker.register_worker();
                for id in chunk {
                    tracker.dispatch(&mut worker, ProducerEvent::destroy(*id, "node"));
                }
            });
        }
    });

    let captured = tracker.stop().unwrap().into_captured().unwrap();
    assert_eq!(captured.unmatched_creations, 0);
    let correlated = captured
        .records
        .iter()
        .filter(|r| match r {
            EventRecord::Destroy(d) => d
                .creation
                .as_ref()
                .is_some_and(|c| c.location.func.as_deref() == Some("make")),
            _ => false,
        })
        .count();
    assert_eq!(correlated, 4000);
}

#[test]
fn test_callback_stop_race_delivers_only_before_stop() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let tracker = Arc::new(Tracker::default());
    let counter = Arc::clone(&delivered);
    tracker
        .start(Delivery::callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let mut worker = tracker.register_worker();
                (0..5000)
                    .filter(|i| {
                        tracker
                            .dispatch(&mut worker, ProducerEvent::create(*i, "int"))
                            .is_accepted()
                    })
                    .count()
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(2));
    let captured = tracker.stop().unwrap().into_captured().unwrap();
    let at_stop = delivered.load(Ordering::SeqCst);
    let accepted: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();

    assert_eq!(at_stop, accepted);
    assert_eq!(captured.delivered, accepted);
    assert_eq!(delivered.load(Ordering::SeqCst), at_stop);
}

#[test]
fn test_stress_workload_is_consistent() {
    let tracker = Tracker::default();
    for stop_after_ms in [0, 1, 5] {
        let outcome = workload::run_stress(
            &tracker,
            &StressConfig {
                threads: 8,
                events_per_thread: 1000,
                stop_after: Duration::from_millis(stop_after_ms),
            },
        )
        .unwrap();
        assert!(outcome.is_consistent());
        assert_eq!(outcome.accepted + outcome.rejected, 8000);
    }
}
