//! Thread-safe string interning with stable handles
//!
//! Every distinct string is stored exactly once per table. Interning the same
//! content again returns the same handle, so handles compare by identity
//! (pointer equality) instead of by content.
//!
//! # Layout
//!
//! ```text
//! strings[]  append-only handles, strings[i] owns one shared copy
//!            growing this vector moves the handles, never the text they point to
//!
//! buckets[]  open-addressed index (FNV-1a, linear probing) of offsets into strings[]
//!            rebuilt on growth, never touches strings[]
//! ```
//!
//! All operations take one mutex. Throughput is traded for a simple
//! correctness argument under concurrent stress.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fnv::FnvHasher;
use serde::{Serialize, Serializer};

use crate::invariant;

/// Index capacity used when the configured capacity is 0.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Index load factor above which the index doubles.
pub const LOAD_FACTOR: f64 = 0.75;

/// Initial capacity of the string storage.
const INITIAL_STRINGS_CAPACITY: usize = 256;

/// Marker for an unused index slot.
const EMPTY: usize = usize::MAX;

/// Stable identity for an interned string.
///
/// Equality and hashing use the identity of the shared allocation, not the
/// text. Two handles from the same table are equal exactly when their
/// contents are equal. A handle keeps its text alive on its own, so records
/// holding one stay valid after the table is dropped.
#[derive(Clone)]
pub struct InternedStr(Arc<str>);

impl InternedStr {
    /// The interned text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address of the shared text, usable as a cheap identity key.
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }
}

impl PartialEq for InternedStr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for InternedStr {}

impl Hash for InternedStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl Deref for InternedStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InternedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for InternedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for InternedStr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// FNV-1a over the UTF-8 bytes.
fn fnv1a(s: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish()
}

enum Probe {
    /// Bucket holding an offset whose string equals the key
    Found(usize),
    /// First empty bucket on the probe path
    Vacant(usize),
}

struct Inner {
    strings: Vec<InternedStr>,
    buckets: Vec<usize>,
}

impl Inner {
    fn find_bucket(&self, s: &str, hash: u64) -> Probe {
        let mask = self.buckets.len() - 1;
        let start = (hash as usize) & mask;
        let mut idx = start;
        loop {
            let entry = self.buckets[idx];
            if entry == EMPTY {
                return Probe::Vacant(idx);
            }
            if self.strings[entry].as_str() == s {
                return Probe::Found(idx);
            }
            idx = (idx + 1) & mask;
            if idx == start {
                invariant::fatal("intern index full", "load factor kept below 1.0");
            }
        }
    }

    /// Double the index and re-insert every stored offset.
    fn grow_index(&mut self) {
        let new_capacity = match self.buckets.len().checked_mul(2) {
            Some(capacity) => capacity,
            None => invariant::fatal("intern index capacity overflow", "capacity * 2"),
        };
        self.buckets = empty_buckets(new_capacity);
        for (offset, handle) in self.strings.iter().enumerate() {
            match self.find_bucket(handle.as_str(), fnv1a(handle.as_str())) {
                Probe::Vacant(bucket) => self.buckets[bucket] = offset,
                Probe::Found(_) => invariant::fatal("duplicate string in intern storage", "rehash"),
            }
        }
        tracing::trace!(capacity = new_capacity, strings = self.strings.len(), "intern index grown");
    }

    fn ensure_strings_capacity(&mut self) {
        let len = self.strings.len();
        if len < self.strings.capacity() {
            return;
        }
        let target = (self.strings.capacity() * 2).max(INITIAL_STRINGS_CAPACITY);
        if let Err(err) = self.strings.try_reserve_exact(target - len) {
            invariant::allocation_failed("intern strings", &err);
        }
    }
}

fn empty_buckets(capacity: usize) -> Vec<usize> {
    let mut buckets = Vec::new();
    if let Err(err) = buckets.try_reserve_exact(capacity) {
        invariant::allocation_failed("intern index", &err);
    }
    buckets.resize(capacity, EMPTY);
    buckets
}

/// Session-lifetime string interning table.
pub struct InternTable {
    inner: Mutex<Inner>,
}

impl InternTable {
    /// Create a table with the default index capacity.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a table whose index starts with at least `initial_capacity`
    /// slots, rounded up to a power of two. 0 selects [`DEFAULT_CAPACITY`].
    pub fn with_capacity(initial_capacity: usize) -> Self {
        let capacity = if initial_capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            match initial_capacity.checked_next_power_of_two() {
                Some(capacity) => capacity,
                None => invariant::fatal(
                    "intern capacity too large",
                    "initial_capacity.checked_next_power_of_two()",
                ),
            }
        };

        let mut strings = Vec::new();
        if let Err(err) = strings.try_reserve_exact(INITIAL_STRINGS_CAPACITY) {
            invariant::allocation_failed("intern strings", &err);
        }

        Self {
            inner: Mutex::new(Inner {
                strings,
                buckets: empty_buckets(capacity),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written entry:
        // the offset is published only after the string is stored.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Intern `s`, returning the table's handle for that content.
    pub fn intern(&self, s: &str) -> InternedStr {
        let hash = fnv1a(s);
        let mut inner = self.lock();

        let mut bucket = match inner.find_bucket(s, hash) {
            Probe::Found(bucket) => return inner.strings[inner.buckets[bucket]].clone(),
            Probe::Vacant(bucket) => bucket,
        };

        let load = (inner.strings.len() + 1) as f64 / inner.buckets.len() as f64;
        if load > LOAD_FACTOR {
            inner.grow_index();
            bucket = match inner.find_bucket(s, hash) {
                Probe::Vacant(bucket) => bucket,
                Probe::Found(_) => invariant::fatal("string appeared during resize", "!found"),
            };
        }

        inner.ensure_strings_capacity();

        let handle = InternedStr(Arc::from(s));
        let offset = inner.strings.len();
        inner.strings.push(handle.clone());
        inner.buckets[bucket] = offset;
        handle
    }

    /// Intern an optional string. `None` stays `None`; `Some("")` is a
    /// regular, distinct entry.
    pub fn intern_opt(&self, s: Option<&str>) -> Option<InternedStr> {
        s.map(|s| self.intern(s))
    }

    /// Whether `s` has been interned, without inserting it.
    pub fn contains(&self, s: &str) -> bool {
        matches!(self.lock().find_bucket(s, fnv1a(s)), Probe::Found(_))
    }

    /// Handle stored at insertion offset `offset`.
    ///
    /// Aborts if `offset` is out of bounds.
    pub fn lookup(&self, offset: usize) -> InternedStr {
        let inner = self.lock();
        crate::require!(offset < inner.strings.len(), "intern lookup out of bounds");
        inner.strings[offset].clone()
    }

    /// Number of distinct strings interned.
    pub fn count(&self) -> usize {
        self.lock().strings.len()
    }

    /// Current index capacity (always a power of two).
    pub fn capacity(&self) -> usize {
        self.lock().buckets.len()
    }
}

impl Default for InternTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InternTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("InternTable")
            .field("count", &inner.strings.len())
            .field("capacity", &inner.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_intern_returns_same_handle_for_same_string() {
        let table = InternTable::new();

        let a1 = table.intern("module.py");
        let a2 = table.intern("module.py");

        assert_eq!(a1, a2);
        assert_eq!(a1.as_ptr(), a2.as_ptr());
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_intern_different_strings_different_handles() {
        let table = InternTable::new();

        let a = table.intern("foo");
        let b = table.intern("bar");

        assert_ne!(a, b);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn test_intern_opt_none_is_none() {
        let table = InternTable::new();
        assert!(table.intern_opt(None).is_none());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_intern_empty_string_is_valid_and_idempotent() {
        let table = InternTable::new();

        let e1 = table.intern("");
        let e2 = table.intern_opt(Some("")).unwrap();

        assert_eq!(e1, e2);
        assert_eq!(e1.as_str(), "");
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_handles_stable_across_growth() {
        let table = InternTable::with_capacity(4);
        let early: Vec<InternedStr> = (0..3).map(|i| table.intern(&format!("early_{}", i))).collect();
        let early_ptrs: Vec<*const u8> = early.iter().map(InternedStr::as_ptr).collect();

        for i in 0..5000 {
            table.intern(&format!("filler_{}", i));
        }
        assert!(table.capacity() > 4);

        for (i, handle) in early.iter().enumerate() {
            let again = table.intern(&format!("early_{}", i));
            assert_eq!(&again, handle);
            assert_eq!(again.as_ptr(), early_ptrs[i]);
            assert_eq!(handle.as_str(), format!("early_{}", i));
        }
    }

    #[test]
    fn test_capacity_rounds_up_to_power_of_two() {
        assert_eq!(InternTable::with_capacity(0).capacity(), DEFAULT_CAPACITY);
        assert_eq!(InternTable::with_capacity(1).capacity(), 1);
        assert_eq!(InternTable::with_capacity(100).capacity(), 128);
        assert_eq!(InternTable::with_capacity(128).capacity(), 128);
    }

    #[test]
    fn test_load_factor_is_respected() {
        let table = InternTable::with_capacity(8);
        for i in 0..6 {
            table.intern(&i.to_string());
        }
        // 6 / 8 = 0.75 is not above the limit
        assert_eq!(table.capacity(), 8);
        table.intern("6");
        assert_eq!(table.capacity(), 16);
    }

    #[test]
    fn test_single_slot_table_grows() {
        let table = InternTable::with_capacity(1);
        let a = table.intern("a");
        let b = table.intern("b");
        assert_ne!(a, b);
        assert_eq!(table.intern("a"), a);
        assert!(table.capacity() >= 4);
    }

    #[test]
    fn test_lookup_by_offset() {
        let table = InternTable::new();
        let first = table.intern("first");
        let second = table.intern("second");

        assert_eq!(table.lookup(0), first);
        assert_eq!(table.lookup(1), second);
    }

    #[test]
    fn test_contains_does_not_insert() {
        let table = InternTable::new();
        assert!(!table.contains("absent"));
        assert_eq!(table.count(), 0);

        table.intern("present");
        assert!(table.contains("present"));
    }

    #[test]
    fn test_handle_outlives_table() {
        let handle = {
            let table = InternTable::new();
            table.intern("survivor")
        };
        assert_eq!(handle.as_str(), "survivor");
    }

    #[test]
    fn test_handles_hash_by_identity() {
        let table = InternTable::new();
        let mut set = HashSet::new();
        set.insert(table.intern("x"));
        set.insert(table.intern("x"));
        set.insert(table.intern("y"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_serialize_as_plain_string() {
        let table = InternTable::new();
        let handle = table.intern("pkg/mod.py");
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"pkg/mod.py\"");
    }

    #[test]
    fn test_concurrent_intern_is_safe() {
        let table = Arc::new(InternTable::with_capacity(16));
        let mut handles = vec![];

        for i in 0..10 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    table.intern(&format!("func_{}_{}", i, j));
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(table.count(), 1000);
    }

    #[test]
    fn test_concurrent_same_string_returns_same_handle() {
        let table = Arc::new(InternTable::new());
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.intern("shared_func"))
            })
            .collect();

        let results: Vec<InternedStr> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first = &results[0];
        for result in &results[1..] {
            assert_eq!(first, result);
        }
        assert_eq!(table.count(), 1);
    }
}
