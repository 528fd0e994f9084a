//! Integration tests for tracking sessions
//!
//! End-to-end scenarios through the public `Tracker` API: the canonical
//! call/create/return/destroy sequence, callback delivery, misuse of
//! start/stop, and repeated sessions on one tracker.

use calltrack::config::TrackerConfig;
use calltrack::event::{EventKind, EventRecord, ProducerEvent, RawArg, RawLocation, RawValue};
use calltrack::session::{
    Captured, Delivery, Dispatched, HookError, ProducerHook, SessionPhase, StopReport, TrackError, Tracker,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn stop(tracker: &Tracker) -> Captured {
    match tracker.stop().unwrap() {
        StopReport::Stopped(captured) => captured,
        StopReport::AlreadyStopped => panic!("session was already stopped"),
    }
}

#[test]
fn test_call_create_return_destroy_scenario() {
    let tracker = Tracker::default();
    let mut worker = tracker.register_worker();
    tracker.start(Delivery::Batched).unwrap();

    let call = ProducerEvent::Call {
        callee: RawLocation::new("a.py", 10, "f"),
        args: vec![RawArg {
            name: "x".into(),
            id: 0x100,
            type_name: "int".into(),
        }],
    };
    assert_eq!(tracker.dispatch(&mut worker, call), Dispatched::Recorded(0));
    assert_eq!(
        tracker.dispatch(&mut worker, ProducerEvent::create(0x10, "list")),
        Dispatched::Recorded(1)
    );
    assert_eq!(
        tracker.dispatch(
            &mut worker,
            ProducerEvent::Return {
                value: Some(RawValue {
                    id: 0x10,
                    type_name: "list".into()
                }),
                raised: false
            }
        ),
        Dispatched::Recorded(2)
    );
    assert_eq!(
        tracker.dispatch(&mut worker, ProducerEvent::destroy(0x10, "list")),
        Dispatched::Recorded(3)
    );
    assert_eq!(tracker.event_count(), 4);

    let captured = stop(&tracker);
    let kinds: Vec<EventKind> = captured.records.iter().map(EventRecord::kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Call, EventKind::Create, EventKind::Return, EventKind::Destroy]
    );

    let EventRecord::Create(create) = &captured.records[1] else {
        panic!("expected create");
    };
    assert_eq!(create.location.func.as_deref(), Some("f"));
    assert_eq!(create.location.line, 10);

    let EventRecord::Destroy(destroy) = &captured.records[3] else {
        panic!("expected destroy");
    };
    // the call has returned, so nothing is executing at destruction
    assert!(destroy.location.is_unknown());
    let creation = destroy.creation.as_ref().unwrap();
    assert_eq!(creation.location.file.as_deref(), Some("a.py"));
    assert_eq!(creation.location.func.as_deref(), Some("f"));
    assert_eq!(creation.type_tag.as_deref(), Some("list"));
    assert_eq!(creation.backtrace.len(), 1);
}

#[test]
fn test_records_outlive_the_session() {
    let tracker = Tracker::default();
    let mut worker = tracker.register_worker();
    tracker.start(Delivery::Batched).unwrap();
    tracker.dispatch(&mut worker, ProducerEvent::call("kept.py", 3, "kept"));
    let captured = stop(&tracker);

    // a new session gets a new interning table
    tracker.start(Delivery::Batched).unwrap();
    tracker.dispatch(&mut worker, ProducerEvent::call("kept.py", 3, "kept"));
    let second = stop(&tracker);

    let first_file = captured.records[0].location().file.clone().unwrap();
    let second_file = second.records[0].location().file.clone().unwrap();
    assert_eq!(first_file.as_str(), "kept.py");
    assert_eq!(first_file.as_str(), second_file.as_str());
    assert_ne!(first_file.as_ptr(), second_file.as_ptr());
}

#[test]
fn test_misuse_is_reported_not_panicked() {
    let tracker = Tracker::default();
    assert!(matches!(tracker.stop(), Err(TrackError::NotActive)));

    tracker.start(Delivery::Batched).unwrap();
    assert!(matches!(tracker.start(Delivery::Batched), Err(TrackError::AlreadyActive)));
    assert_eq!(tracker.phase(), SessionPhase::Active);

    assert!(matches!(tracker.stop(), Ok(StopReport::Stopped(_))));
    assert!(matches!(tracker.stop(), Ok(StopReport::AlreadyStopped)));

    // and the tracker is reusable
    tracker.start(Delivery::Batched).unwrap();
    assert!(tracker.is_active());
    let _ = stop(&tracker);
}

#[test]
fn test_dispatch_after_stop_is_rejected() {
    let tracker = Tracker::default();
    let mut worker = tracker.register_worker();
    tracker.start(Delivery::Batched).unwrap();
    tracker.dispatch(&mut worker, ProducerEvent::create(1, "int"));
    let captured = stop(&tracker);
    assert_eq!(captured.records.len(), 1);
    assert_eq!(captured.unmatched_creations, 1);

    assert_eq!(
        tracker.dispatch(&mut worker, ProducerEvent::destroy(1, "int")),
        Dispatched::Rejected
    );
    assert_eq!(tracker.event_count(), 0);
    assert!(tracker.origin(1).is_none());
}

#[test]
fn test_callback_receives_records_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tracker = Tracker::default();
    let mut worker = tracker.register_worker();

    let sink = Arc::clone(&seen);
    tracker
        .start(Delivery::callback(move |record: &EventRecord| {
            sink.lock().unwrap().push(record.kind());
        }))
        .unwrap();

    tracker.dispatch(&mut worker, ProducerEvent::call("m.py", 1, "f"));
    tracker.dispatch(&mut worker, ProducerEvent::create(9, "set"));
    tracker.dispatch(&mut worker, ProducerEvent::destroy(9, "set"));
    tracker.dispatch(&mut worker, ProducerEvent::ret());

    let captured = stop(&tracker);
    assert!(captured.records.is_empty());
    assert_eq!(captured.delivered, 4);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![EventKind::Call, EventKind::Create, EventKind::Destroy, EventKind::Return]
    );
}

#[test]
fn test_stop_from_handler_keeps_session_active() {
    let tracker = Arc::new(Tracker::default());
    let attempted = Arc::new(AtomicBool::new(false));
    let mut worker = tracker.register_worker();

    let inner = Arc::clone(&tracker);
    let flag = Arc::clone(&attempted);
    tracker
        .start(Delivery::callback(move |_| {
            if let Err(TrackError::FromInsideProtectedSection) = inner.stop() {
                flag.store(true, Ordering::SeqCst);
            }
        }))
        .unwrap();

    tracker.dispatch(&mut worker, ProducerEvent::call("m.py", 1, "handler_stops"));
    assert!(attempted.load(Ordering::SeqCst));
    assert!(tracker.is_active());

    // the session still accepts events
    assert_eq!(
        tracker.dispatch(&mut worker, ProducerEvent::ret()),
        Dispatched::Delivered
    );
    let captured = stop(&tracker);
    assert_eq!(captured.delivered, 2);
}

#[test]
fn test_handler_may_dispatch_recursively() {
    let tracker = Arc::new(Tracker::default());
    let inner = Arc::clone(&tracker);
    let nested = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&nested);

    tracker
        .start(Delivery::callback(move |record| {
            if record.kind() == EventKind::Create {
                let mut helper = inner.register_worker();
                inner.dispatch(&mut helper, ProducerEvent::destroy(record.object_id().unwrap_or(0), "int"));
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }))
        .unwrap();

    let mut worker = tracker.register_worker();
    tracker.dispatch(&mut worker, ProducerEvent::create(5, "int"));

    let captured = stop(&tracker);
    assert_eq!(nested.load(Ordering::SeqCst), 1);
    assert_eq!(captured.delivered, 2);
    assert_eq!(captured.unmatched_creations, 0);
}

struct ToggleHook {
    fail_next: Arc<AtomicBool>,
    installed: Arc<AtomicBool>,
}

impl ProducerHook for ToggleHook {
    fn install(&mut self) -> Result<(), HookError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(HookError::new("engine refused tracer"));
        }
        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn uninstall(&mut self) {
        self.installed.store(false, Ordering::SeqCst);
    }
}

#[test]
fn test_failed_hook_install_rolls_back() {
    let fail_next = Arc::new(AtomicBool::new(true));
    let installed = Arc::new(AtomicBool::new(false));
    let tracker = Tracker::with_hook(
        TrackerConfig::default(),
        ToggleHook {
            fail_next: Arc::clone(&fail_next),
            installed: Arc::clone(&installed),
        },
    );

    assert!(matches!(tracker.start(Delivery::Batched), Err(TrackError::HookInstall(_))));
    assert!(!tracker.is_active());
    assert!(!installed.load(Ordering::SeqCst));

    tracker.start(Delivery::Batched).unwrap();
    assert!(installed.load(Ordering::SeqCst));
    let _ = stop(&tracker);
    assert!(!installed.load(Ordering::SeqCst));
}
