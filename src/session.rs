//! Session controller
//!
//! A [`Tracker`] owns one [`StopBarrier`] and, while a session runs, the
//! per-session resources: interning table, event log, and creation table.
//! Producers report events through [`Tracker::dispatch`]; each dispatch runs
//! inside a protected section, so [`Tracker::stop`] can tear everything down
//! as soon as the drain completes.
//!
//! ```text
//! Idle --start--> Active --stop--> Draining --drain done--> Idle
//! ```
//!
//! # Example
//!
//! ```
//! use calltrack::event::ProducerEvent;
//! use calltrack::session::{Delivery, StopReport, Tracker};
//!
//! let tracker = Tracker::default();
//! let mut worker = tracker.register_worker();
//!
//! tracker.start(Delivery::Batched).unwrap();
//! tracker.dispatch(&mut worker, ProducerEvent::call("app.py", 1, "main"));
//! tracker.dispatch(&mut worker, ProducerEvent::ret());
//!
//! let StopReport::Stopped(captured) = tracker.stop().unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(captured.records.len(), 2);
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;

use crate::barrier::{StopBarrier, StopOutcome};
use crate::config::TrackerConfig;
use crate::context;
use crate::correlation::CreationTable;
use crate::event::{
    ArgRecord, CallRecord, CreateRecord, CreationRecord, DestroyRecord, EventRecord, FieldErrors,
    Location, ObjectId, ProducerEvent, RawLocation, RecordHeader, ReturnRecord, ValueRecord,
    MAX_ARGS, MAX_BACKTRACE_DEPTH,
};
use crate::event_log::EventLog;
use crate::frame_stack::Worker;
use crate::interning::InternTable;
use crate::invariant;

/// Maximum callback failure messages kept per session.
pub const MAX_CALLBACK_FAILURES: usize = 64;

const IDLE: u8 = 0;
const ACTIVE: u8 = 1;
const DRAINING: u8 = 2;

/// Failure reported by a [`ProducerHook`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors returned by [`Tracker::start`] and [`Tracker::stop`].
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("a tracking session is already active")]
    AlreadyActive,

    #[error("no tracking session has been started")]
    NotActive,

    #[error("cannot start or stop tracking from inside a dispatched event")]
    FromInsideProtectedSection,

    #[error("failed to install producer hook: {0}")]
    HookInstall(#[from] HookError),
}

/// Mechanism that makes the host engine report events.
///
/// Installed after the session's barrier is live and removed after it has
/// drained, so the hook never sees a half-built or half-torn-down session.
pub trait ProducerHook: Send {
    fn install(&mut self) -> Result<(), HookError>;
    fn uninstall(&mut self);
}

/// Hook for producers that call [`Tracker::dispatch`] directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualHook;

impl ProducerHook for ManualHook {
    fn install(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    fn uninstall(&mut self) {}
}

/// Consumer callback for [`Delivery::Callback`].
pub type EventHandler = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// How a session hands records to the consumer.
#[derive(Clone)]
pub enum Delivery {
    /// Accumulate records and return them from [`Tracker::stop`]
    Batched,
    /// Pass each record to the handler inside the protected section
    Callback(EventHandler),
}

impl Delivery {
    pub fn callback(handler: impl Fn(&EventRecord) + Send + Sync + 'static) -> Self {
        Delivery::Callback(Arc::new(handler))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Batched => f.write_str("Batched"),
            Delivery::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Outcome of a single [`Tracker::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Appended to the event log at this index
    Recorded(usize),
    /// Passed to the session's callback
    Delivered,
    /// No session was accepting events
    Rejected,
}

impl Dispatched {
    pub fn is_accepted(self) -> bool {
        !matches!(self, Dispatched::Rejected)
    }
}

/// Everything a finished session hands to the consumer.
#[derive(Debug, Default)]
pub struct Captured {
    /// Records in append order (empty for callback delivery)
    pub records: Vec<EventRecord>,
    /// Records passed to the callback
    pub delivered: usize,
    /// Panic messages from the callback, at most [`MAX_CALLBACK_FAILURES`]
    pub callback_failures: Vec<String>,
    pub callback_failures_dropped: u32,
    /// Distinct strings interned during the session
    pub interned_strings: usize,
    /// Objects created and never destroyed while the session ran
    pub unmatched_creations: usize,
}

/// Result of a successful [`Tracker::stop`].
#[must_use]
#[derive(Debug)]
pub enum StopReport {
    Stopped(Captured),
    /// The last session had already been stopped
    AlreadyStopped,
}

impl StopReport {
    pub fn into_captured(self) -> Option<Captured> {
        match self {
            StopReport::Stopped(captured) => Some(captured),
            StopReport::AlreadyStopped => None,
        }
    }
}

/// Observable session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Active,
    Draining,
}

#[derive(Debug, Default)]
struct CallbackFailures {
    messages: Vec<String>,
    dropped: u32,
}

impl CallbackFailures {
    fn push(&mut self, message: String) {
        if self.messages.len() >= MAX_CALLBACK_FAILURES {
            self.dropped = self.dropped.saturating_add(1);
        } else {
            self.messages.push(message);
        }
    }
}

/// Per-session resources. Only reachable from inside a protected section.
#[derive(Debug)]
struct Session {
    strings: InternTable,
    log: EventLog,
    creations: CreationTable,
    delivery: Delivery,
    delivered: AtomicUsize,
    failures: Mutex<CallbackFailures>,
}

impl Session {
    fn new(config: &TrackerConfig, delivery: Delivery) -> Self {
        Self {
            strings: InternTable::with_capacity(config.intern_capacity()),
            log: EventLog::new(),
            creations: CreationTable::new(),
            delivery,
            delivered: AtomicUsize::new(0),
            failures: Mutex::new(CallbackFailures::default()),
        }
    }

    fn event_count(&self) -> usize {
        match self.delivery {
            Delivery::Batched => self.log.len(),
            Delivery::Callback(_) => self.delivered.load(Ordering::Relaxed),
        }
    }

    fn location(&self, raw: &RawLocation<'_>, errors: &mut FieldErrors) -> Location {
        Location::new(
            errors.intern(&self.strings, &raw.file, "file"),
            raw.line,
            errors.intern(&self.strings, &raw.func, "func"),
        )
    }

    /// Build the record for `event`, updating the worker's frame stack and
    /// the creation table.
    fn record(&self, worker: &mut Worker, event: ProducerEvent<'_>) -> EventRecord {
        let mut errors = FieldErrors::default();
        let worker_id = worker.id();
        let timestamp_ns = context::timestamp_ns();

        match event {
            ProducerEvent::Call { callee, args } => {
                let location = self.location(&callee, &mut errors);
                worker.frames_mut().push(location.clone());
                let caller = worker.frames().caller().cloned().unwrap_or_default();
                let args = args
                    .iter()
                    .take(MAX_ARGS)
                    .enumerate()
                    .map(|(i, arg)| ArgRecord {
                        name: errors.intern(&self.strings, &arg.name, &format!("arg[{i}].name")),
                        id: arg.id,
                        type_name: errors.intern(&self.strings, &arg.type_name, &format!("arg[{i}].type")),
                    })
                    .collect();
                EventRecord::Call(CallRecord {
                    header: RecordHeader {
                        worker: worker_id,
                        timestamp_ns,
                        errors,
                    },
                    location,
                    caller,
                    args,
                })
            }
            ProducerEvent::Return { value, raised } => {
                // The matching call may predate this session
                let location = if worker.frames().is_empty() {
                    tracing::trace!(worker = worker_id, "return without a recorded call");
                    Location::unknown()
                } else {
                    worker.frames_mut().pop()
                };
                let value = value.map(|v| ValueRecord {
                    id: v.id,
                    type_name: errors.intern(&self.strings, &v.type_name, "return_type"),
                });
                EventRecord::Return(ReturnRecord {
                    header: RecordHeader {
                        worker: worker_id,
                        timestamp_ns,
                        errors,
                    },
                    location,
                    value,
                    raised,
                })
            }
            ProducerEvent::Create { id, type_name } => {
                let type_tag = errors.intern(&self.strings, &type_name, "type");
                let frames = worker.frames();
                let location = frames.top().cloned().unwrap_or_default();
                self.creations.record_creation(
                    id,
                    CreationRecord {
                        location: location.clone(),
                        backtrace: frames.backtrace(MAX_BACKTRACE_DEPTH),
                        type_tag: type_tag.clone(),
                    },
                );
                EventRecord::Create(CreateRecord {
                    header: RecordHeader {
                        worker: worker_id,
                        timestamp_ns,
                        errors,
                    },
                    id,
                    type_tag,
                    location,
                })
            }
            ProducerEvent::Destroy { id, type_name } => {
                let type_tag = errors.intern(&self.strings, &type_name, "type");
                let location = worker.frames().top().cloned().unwrap_or_default();
                let creation = self.creations.take_on_destruction(id);
                EventRecord::Destroy(DestroyRecord {
                    header: RecordHeader {
                        worker: worker_id,
                        timestamp_ns,
                        errors,
                    },
                    id,
                    type_tag,
                    location,
                    creation,
                })
            }
        }
    }

    fn deliver(&self, handler: &EventHandler, record: &EventRecord) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(record))) {
            let message = panic_message(payload.as_ref());
            tracing::warn!(event = %record.kind(), %message, "event callback panicked");
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message);
        }
    }

    fn into_captured(self) -> Captured {
        let failures = self.failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        Captured {
            interned_strings: self.strings.count(),
            unmatched_creations: self.creations.len(),
            delivered: self.delivered.into_inner(),
            records: self.log.into_records(),
            callback_failures: failures.messages,
            callback_failures_dropped: failures.dropped,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Control {
    hook: Box<dyn ProducerHook>,
    ever_started: bool,
}

/// Call and object lifecycle tracker.
///
/// Shared between producer threads (typically behind an `Arc`). At most one
/// session is active at a time.
pub struct Tracker {
    config: TrackerConfig,
    barrier: StopBarrier,
    control: Mutex<Control>,
    session: RwLock<Option<Arc<Session>>>,
    phase: AtomicU8,
    epoch: AtomicU64,
}

impl Tracker {
    /// Tracker whose producers call [`dispatch`](Self::dispatch) directly.
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_hook(config, ManualHook)
    }

    /// Tracker that installs `hook` for the duration of each session.
    pub fn with_hook(config: TrackerConfig, hook: impl ProducerHook + 'static) -> Self {
        Self {
            config,
            barrier: StopBarrier::new(),
            control: Mutex::new(Control {
                hook: Box::new(hook),
                ever_started: false,
            }),
            session: RwLock::new(None),
            phase: AtomicU8::new(IDLE),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_session(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, session)
    }

    /// Create a producer context for one thread.
    pub fn register_worker(&self) -> Worker {
        let worker = Worker::new();
        tracing::debug!(worker = worker.id(), "worker registered");
        worker
    }

    /// Begin a session.
    ///
    /// Allocates the session's resources, invalidates every worker's frame
    /// stack, opens the barrier, and installs the producer hook.
    pub fn start(&self, delivery: Delivery) -> Result<(), TrackError> {
        if self.barrier.in_protected_section() {
            return Err(TrackError::FromInsideProtectedSection);
        }
        let mut control = self.control();
        if self.phase.load(Ordering::Acquire) != IDLE {
            return Err(TrackError::AlreadyActive);
        }

        let session = Arc::new(Session::new(&self.config, delivery));
        self.replace_session(Some(session));
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.barrier.init();
        // Dispatches are accepted from here on, so report the session as active.
        self.phase.store(ACTIVE, Ordering::Release);

        if let Err(err) = control.hook.install() {
            tracing::warn!(error = %err, "producer hook installation failed");
            // Producers may already have entered through another path
            match self.barrier.stop() {
                StopOutcome::Ok => {}
                StopOutcome::FromInsideProtectedSection => {
                    invariant::fatal("hook rollback from inside a protected section", "!in_protected_section()")
                }
            }
            self.barrier.destroy();
            self.replace_session(None);
            self.phase.store(IDLE, Ordering::Release);
            return Err(TrackError::HookInstall(err));
        }

        control.ever_started = true;
        tracing::debug!(epoch, intern_capacity = self.config.effective_intern_capacity(), "tracking session started");
        Ok(())
    }

    /// End the session and hand over what it captured.
    ///
    /// Blocks until every in-flight dispatch has finished.
    pub fn stop(&self) -> Result<StopReport, TrackError> {
        if self.barrier.in_protected_section() {
            return Err(TrackError::FromInsideProtectedSection);
        }
        let mut control = self.control();
        if self.phase.load(Ordering::Acquire) == IDLE {
            return if control.ever_started {
                Ok(StopReport::AlreadyStopped)
            } else {
                Err(TrackError::NotActive)
            };
        }

        self.phase.store(DRAINING, Ordering::Release);
        tracing::debug!(in_flight = self.barrier.active_count(), "tracking session draining");
        if self.barrier.stop() == StopOutcome::FromInsideProtectedSection {
            self.phase.store(ACTIVE, Ordering::Release);
            return Err(TrackError::FromInsideProtectedSection);
        }

        control.hook.uninstall();
        self.barrier.destroy();

        let captured = match self.replace_session(None).map(Arc::try_unwrap) {
            Some(Ok(session)) => session.into_captured(),
            Some(Err(_)) => invariant::fatal("session still referenced after drain", "Arc::strong_count == 1"),
            None => Captured::default(),
        };
        self.phase.store(IDLE, Ordering::Release);

        tracing::debug!(
            records = captured.records.len(),
            delivered = captured.delivered,
            callback_failures = captured.callback_failures.len(),
            unmatched_creations = captured.unmatched_creations,
            "tracking session stopped"
        );
        Ok(StopReport::Stopped(captured))
    }

    /// Report one producer event from `worker`.
    pub fn dispatch(&self, worker: &mut Worker, event: ProducerEvent<'_>) -> Dispatched {
        let Some(_section) = self.barrier.enter() else {
            tracing::trace!(worker = worker.id(), event = %event.kind(), "event rejected");
            return Dispatched::Rejected;
        };
        let Some(session) = self.current_session() else {
            return Dispatched::Rejected;
        };
        worker.enter_epoch(self.epoch.load(Ordering::Acquire));

        let record = session.record(worker, event);
        match &session.delivery {
            Delivery::Batched => Dispatched::Recorded(session.log.append(record)),
            Delivery::Callback(handler) => {
                session.deliver(handler, &record);
                Dispatched::Delivered
            }
        }
    }

    /// Whether a session is accepting events.
    pub fn is_active(&self) -> bool {
        self.phase.load(Ordering::Acquire) == ACTIVE && !self.barrier.is_stopping()
    }

    pub fn phase(&self) -> SessionPhase {
        match self.phase.load(Ordering::Acquire) {
            ACTIVE => SessionPhase::Active,
            DRAINING => SessionPhase::Draining,
            _ => SessionPhase::Idle,
        }
    }

    /// Records captured so far in the running session; 0 when idle.
    pub fn event_count(&self) -> usize {
        self.barrier
            .dispatch(|| self.current_session().map_or(0, |s| s.event_count()))
            .unwrap_or(0)
    }

    /// Creation context of a live object in the running session.
    pub fn origin(&self, id: ObjectId) -> Option<CreationRecord> {
        self.barrier
            .dispatch(|| self.current_session().and_then(|s| s.creations.origin(id)))
            .flatten()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .field("barrier", &self.barrier.state())
            .finish()
    }
}
