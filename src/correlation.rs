//! Creation/destruction correlation
//!
//! Maps an object identity to the context captured when the object was
//! created, so the later destruction event can carry it. Callers must hold a
//! protected section of the session's stop barrier while using the table.

use std::sync::{Mutex, MutexGuard, PoisonError};

use fnv::FnvHashMap;

use crate::event::{CreationRecord, ObjectId};

/// Concurrent map from object identity to [`CreationRecord`].
#[derive(Debug, Default)]
pub struct CreationTable {
    records: Mutex<FnvHashMap<ObjectId, CreationRecord>>,
}

impl CreationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FnvHashMap<ObjectId, CreationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the creation context of `id`.
    ///
    /// If `id` is already present the host has reused the identity, and the
    /// new occupant replaces the old entry. Returns `true` in that case.
    pub fn record_creation(&self, id: ObjectId, record: CreationRecord) -> bool {
        let replaced = self.lock().insert(id, record).is_some();
        if replaced {
            tracing::trace!(id, "object identity reused before destruction");
        }
        replaced
    }

    /// Look up and erase the creation context of `id` in one step.
    pub fn take_on_destruction(&self, id: ObjectId) -> Option<CreationRecord> {
        self.lock().remove(&id)
    }

    /// Copy of the creation context of a live object.
    pub fn origin(&self, id: ObjectId) -> Option<CreationRecord> {
        self.lock().get(&id).cloned()
    }

    /// Number of objects created and not yet destroyed.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
