//! Event data model
//!
//! Outbound records ([`EventRecord`]) are what the tracker accumulates and
//! hands to an encoder. Inbound events ([`ProducerEvent`]) are what a host
//! engine hook reports; their text fields are already translated by the
//! producer and may carry per-field translation failures.

use serde::Serialize;
use thiserror::Error;

use crate::context::WorkerId;
use crate::interning::{InternTable, InternedStr};

/// Maximum frames captured in a creation backtrace.
pub const MAX_BACKTRACE_DEPTH: usize = 16;

/// Maximum arguments captured per call.
pub const MAX_ARGS: usize = 8;

/// Maximum field errors kept per record.
pub const MAX_FIELD_ERRORS: usize = 8;

/// Opaque object identity reported by the host.
///
/// Not an ownership handle: the host may reuse an identity once the object it
/// named has been destroyed.
pub type ObjectId = u64;

/// Source location of a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    pub file: Option<InternedStr>,
    pub line: i32,
    pub func: Option<InternedStr>,
}

impl Location {
    /// Location with the given interned parts.
    pub fn new(file: Option<InternedStr>, line: i32, func: Option<InternedStr>) -> Self {
        Self { file, line, func }
    }

    /// The "unknown caller" location.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// True if every part is absent or zero.
    pub fn is_unknown(&self) -> bool {
        self.file.is_none() && self.func.is_none() && self.line == 0
    }
}

/// Context captured when an object is first observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreationRecord {
    /// Frame that created the object
    pub location: Location,
    /// Enclosing frames, innermost first, at most [`MAX_BACKTRACE_DEPTH`]
    pub backtrace: Vec<Location>,
    /// Host type name of the object
    pub type_tag: Option<InternedStr>,
}

/// A field that could not be translated into text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Field name, e.g. `file`, `func`, `arg[2].name`
    pub field: String,
    /// Error kind as reported by the host
    pub kind: String,
    pub message: String,
}

/// Translation failure reported by the producer for one field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TranslationError {
    pub kind: String,
    pub message: String,
}

impl TranslationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A producer-translated text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawText<'a> {
    Text(&'a str),
    /// The host has no value for this field (e.g. a builtin without a file)
    Absent,
    /// The host value exists but could not be represented as text
    Untranslatable(TranslationError),
}

impl<'a> From<&'a str> for RawText<'a> {
    fn from(s: &'a str) -> Self {
        RawText::Text(s)
    }
}

impl<'a> From<Option<&'a str>> for RawText<'a> {
    fn from(s: Option<&'a str>) -> Self {
        s.map_or(RawText::Absent, RawText::Text)
    }
}

/// Per-record list of field errors, bounded to [`MAX_FIELD_ERRORS`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldErrors {
    pub errors: Vec<FieldError>,
    /// Errors dropped after the bound was reached
    pub truncated: u32,
}

impl FieldErrors {
    pub fn push(&mut self, field: impl Into<String>, err: &TranslationError) {
        if self.errors.len() >= MAX_FIELD_ERRORS {
            self.truncated = self.truncated.saturating_add(1);
            return;
        }
        self.errors.push(FieldError {
            field: field.into(),
            kind: err.kind.clone(),
            message: err.message.clone(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.truncated == 0
    }

    /// Translate `raw` through `strings`, recording a field error on failure.
    pub fn intern(&mut self, strings: &InternTable, raw: &RawText<'_>, field: &str) -> Option<InternedStr> {
        match raw {
            RawText::Text(s) => Some(strings.intern(s)),
            RawText::Absent => None,
            RawText::Untranslatable(err) => {
                self.push(field, err);
                None
            }
        }
    }
}

/// Fields shared by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHeader {
    pub worker: WorkerId,
    pub timestamp_ns: u64,
    pub errors: FieldErrors,
}

/// One captured call argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArgRecord {
    pub name: Option<InternedStr>,
    pub id: ObjectId,
    pub type_name: Option<InternedStr>,
}

/// Returned value of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueRecord {
    pub id: ObjectId,
    pub type_name: Option<InternedStr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub header: RecordHeader,
    pub location: Location,
    pub caller: Location,
    pub args: Vec<ArgRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReturnRecord {
    pub header: RecordHeader,
    /// Location of the call being returned from
    pub location: Location,
    pub value: Option<ValueRecord>,
    /// The frame exited by raising
    pub raised: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateRecord {
    pub header: RecordHeader,
    pub id: ObjectId,
    pub type_tag: Option<InternedStr>,
    /// Frame executing when the object was created
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyRecord {
    pub header: RecordHeader,
    pub id: ObjectId,
    pub type_tag: Option<InternedStr>,
    /// Frame executing when the object was destroyed
    pub location: Location,
    /// Context captured at creation, if the creation was observed
    pub creation: Option<CreationRecord>,
}

/// One captured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventRecord {
    Call(CallRecord),
    Return(ReturnRecord),
    Create(CreateRecord),
    Destroy(DestroyRecord),
}

/// Discriminant of an [`EventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Call,
    Return,
    Create,
    Destroy,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Call => "CALL",
            EventKind::Return => "RETURN",
            EventKind::Create => "CREATE",
            EventKind::Destroy => "DESTROY",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventRecord {
    pub fn kind(&self) -> EventKind {
        match self {
            EventRecord::Call(_) => EventKind::Call,
            EventRecord::Return(_) => EventKind::Return,
            EventRecord::Create(_) => EventKind::Create,
            EventRecord::Destroy(_) => EventKind::Destroy,
        }
    }

    pub fn header(&self) -> &RecordHeader {
        match self {
            EventRecord::Call(r) => &r.header,
            EventRecord::Return(r) => &r.header,
            EventRecord::Create(r) => &r.header,
            EventRecord::Destroy(r) => &r.header,
        }
    }

    /// Primary location of the event
    pub fn location(&self) -> &Location {
        match self {
            EventRecord::Call(r) => &r.location,
            EventRecord::Return(r) => &r.location,
            EventRecord::Create(r) => &r.location,
            EventRecord::Destroy(r) => &r.location,
        }
    }

    /// Object identity the event refers to, if any
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            EventRecord::Call(_) => None,
            EventRecord::Return(r) => r.value.as_ref().map(|v| v.id),
            EventRecord::Create(r) => Some(r.id),
            EventRecord::Destroy(r) => Some(r.id),
        }
    }
}

/// Callee location as reported by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLocation<'a> {
    pub file: RawText<'a>,
    pub line: i32,
    pub func: RawText<'a>,
}

impl<'a> RawLocation<'a> {
    pub fn new(file: impl Into<RawText<'a>>, line: i32, func: impl Into<RawText<'a>>) -> Self {
        Self {
            file: file.into(),
            line,
            func: func.into(),
        }
    }
}

/// Call argument as reported by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArg<'a> {
    pub name: RawText<'a>,
    pub id: ObjectId,
    pub type_name: RawText<'a>,
}

/// Object reference as reported by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue<'a> {
    pub id: ObjectId,
    pub type_name: RawText<'a>,
}

/// Event reported by the host engine hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent<'a> {
    /// A frame starts executing
    Call {
        callee: RawLocation<'a>,
        args: Vec<RawArg<'a>>,
    },
    /// The innermost frame on this worker finishes
    Return {
        value: Option<RawValue<'a>>,
        raised: bool,
    },
    /// An object is allocated
    Create {
        id: ObjectId,
        type_name: RawText<'a>,
    },
    /// An object is deallocated
    Destroy {
        id: ObjectId,
        type_name: RawText<'a>,
    },
}

impl<'a> ProducerEvent<'a> {
    /// Call event without arguments.
    pub fn call(file: impl Into<RawText<'a>>, line: i32, func: impl Into<RawText<'a>>) -> Self {
        ProducerEvent::Call {
            callee: RawLocation::new(file, line, func),
            args: Vec::new(),
        }
    }

    /// Return event without a value.
    pub fn ret() -> Self {
        ProducerEvent::Return {
            value: None,
            raised: false,
        }
    }

    pub fn create(id: ObjectId, type_name: impl Into<RawText<'a>>) -> Self {
        ProducerEvent::Create {
            id,
            type_name: type_name.into(),
        }
    }

    pub fn destroy(id: ObjectId, type_name: impl Into<RawText<'a>>) -> Self {
        ProducerEvent::Destroy {
            id,
            type_name: type_name.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ProducerEvent::Call { .. } => EventKind::Call,
            ProducerEvent::Return { .. } => EventKind::Return,
            ProducerEvent::Create { .. } => EventKind::Create,
            ProducerEvent::Destroy { .. } => EventKind::Destroy,
        }
    }
}
