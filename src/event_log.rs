//! Append-only event log
//!
//! Records are appended by producers inside protected sections and read only
//! after the session has stopped. Growth and append happen under one lock, so
//! two producers racing to grow never allocate twice.
//!
//! A failed growth aborts the process. Dropping an event to stay available
//! would leave the consumer with telemetry that silently lies.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::event::EventRecord;
use crate::invariant;

/// Capacity of the first allocation.
pub const INITIAL_CAPACITY: usize = 4096;

/// Thread-safe, append-only sequence of [`EventRecord`]s.
#[derive(Debug, Default)]
pub struct EventLog {
    records: Mutex<Vec<EventRecord>>,
}

impl EventLog {
    /// Create an empty log. The first append allocates [`INITIAL_CAPACITY`].
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EventRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record and return its index.
    pub fn append(&self, record: EventRecord) -> usize {
        let mut records = self.lock();
        ensure_capacity(&mut records, 1);
        let index = records.len();
        records.push(record);
        index
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Take every record out of the log, in append order.
    pub fn into_records(self) -> Vec<EventRecord> {
        self.records.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the records out, leaving the log empty.
    pub fn take_records(&self) -> Vec<EventRecord> {
        std::mem::take(&mut *self.lock())
    }
}

/// Grow `records` by doubling until `needed` more records fit.
fn ensure_capacity(records: &mut Vec<EventRecord>, needed: usize) {
    let required = records.len() + needed;
    if required <= records.capacity() {
        return;
    }
    let mut target = if records.capacity() == 0 {
        INITIAL_CAPACITY
    } else {
        records.capacity()
    };
    while target < required {
        target = match target.checked_mul(2) {
            Some(target) => target,
            None => invariant::fatal("event log capacity overflow", "capacity * 2"),
        };
    }
    if let Err(err) = records.try_reserve_exact(target - records.len()) {
        invariant::allocation_failed("event log", &err);
    }
    tracing::trace!(capacity = target, "event log grown");
}
