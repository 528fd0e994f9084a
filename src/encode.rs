//! Consumer-side encoding of captured records
//!
//! [`EventEncoder`] is the open seam; [`JsonEncoder`] produces flat JSON
//! objects and [`TextEncoder`] produces one human-readable line per record.
//! Records that lost field errors to truncation, and failures while writing
//! the output, are collected in a bounded [`OutputErrors`] list instead of
//! aborting the whole export.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::event::{CreationRecord, EventRecord, Location, MAX_FIELD_ERRORS};

/// Maximum output errors kept per export.
pub const MAX_OUTPUT_ERRORS: usize = 64;

/// One failure while producing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputError {
    /// Where it happened, e.g. `events[42]`
    pub context: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Output errors, bounded to [`MAX_OUTPUT_ERRORS`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputErrors {
    pub errors: Vec<OutputError>,
    /// Errors dropped after the bound was reached
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl OutputErrors {
    pub fn push(&mut self, context: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) {
        if self.errors.len() >= MAX_OUTPUT_ERRORS {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        self.errors.push(OutputError {
            context: context.into(),
            kind: kind.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.dropped == 0
    }

    /// Errors seen, including dropped ones.
    pub fn total(&self) -> usize {
        self.errors.len() + self.dropped as usize
    }
}

/// Encoded events plus whatever went wrong producing them.
#[derive(Debug, Clone, Serialize)]
pub struct EncodedTrace<E> {
    pub events: Vec<E>,
    #[serde(skip_serializing_if = "OutputErrors::is_empty")]
    pub output_errors: OutputErrors,
}

/// Converts captured records into an external representation.
pub trait EventEncoder {
    type Event: Serialize;

    /// Encode the record at position `index`, reporting partial failures
    /// into `errors`.
    fn encode_event(&self, index: usize, record: &EventRecord, errors: &mut OutputErrors) -> Self::Event;

    fn encode(&self, records: &[EventRecord]) -> EncodedTrace<Self::Event> {
        let mut output_errors = OutputErrors::default();
        let events = records
            .iter()
            .enumerate()
            .map(|(i, record)| self.encode_event(i, record, &mut output_errors))
            .collect();
        EncodedTrace { events, output_errors }
    }
}

/// Location inside a creation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonFrame {
    pub file: Option<String>,
    pub line: i32,
    pub func: Option<String>,
}

impl From<&Location> for JsonFrame {
    fn from(loc: &Location) -> Self {
        Self {
            file: loc.file.as_deref().map(str::to_owned),
            line: loc.line,
            func: loc.func.as_deref().map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonCreation {
    pub file: Option<String>,
    pub line: i32,
    pub func: Option<String>,
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    pub traceback: Vec<JsonFrame>,
}

impl From<&CreationRecord> for JsonCreation {
    fn from(rec: &CreationRecord) -> Self {
        Self {
            file: rec.location.file.as_deref().map(str::to_owned),
            line: rec.location.line,
            func: rec.location.func.as_deref().map(str::to_owned),
            type_name: rec.type_tag.as_deref().map(str::to_owned),
            traceback: rec.backtrace.iter().map(JsonFrame::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonArg {
    pub name: Option<String>,
    pub id: u64,
    #[serde(rename = "type")]
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonFieldError {
    pub field: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Flat JSON form of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonEvent {
    /// `CALL`, `RETURN`, `CREATE` or `DESTROY`
    pub event: String,
    pub file: Option<String>,
    pub line: i32,
    pub func: Option<String>,
    pub worker: u64,
    pub timestamp_ns: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_line: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_func: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<JsonArg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub raised: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<JsonCreation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JsonFieldError>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub errors_truncated: u32,
}

fn owned(s: &Option<crate::interning::InternedStr>) -> Option<String> {
    s.as_deref().map(str::to_owned)
}

/// Encoder producing [`JsonEvent`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl EventEncoder for JsonEncoder {
    type Event = JsonEvent;

    fn encode_event(&self, index: usize, record: &EventRecord, errors: &mut OutputErrors) -> JsonEvent {
        report_truncated_field_errors(index, record, errors);
        let header = record.header();
        let location = record.location();
        let mut event = JsonEvent {
            event: record.kind().as_str().to_string(),
            file: owned(&location.file),
            line: location.line,
            func: owned(&location.func),
            worker: header.worker,
            timestamp_ns: header.timestamp_ns,
            caller_file: None,
            caller_line: None,
            caller_func: None,
            args: Vec::new(),
            return_id: None,
            return_type: None,
            raised: false,
            id: None,
            type_name: None,
            creation: None,
            errors: header
                .errors
                .errors
                .iter()
                .map(|e| JsonFieldError {
                    field: e.field.clone(),
                    kind: e.kind.clone(),
                    message: e.message.clone(),
                })
                .collect(),
            errors_truncated: header.errors.truncated,
        };

        match record {
            EventRecord::Call(call) => {
                if !call.caller.is_unknown() {
                    event.caller_file = owned(&call.caller.file);
                    event.caller_line = Some(call.caller.line);
                    event.caller_func = owned(&call.caller.func);
                }
                event.args = call
                    .args
                    .iter()
                    .map(|a| JsonArg {
                        name: owned(&a.name),
                        id: a.id,
                        type_name: owned(&a.type_name),
                    })
                    .collect();
            }
            EventRecord::Return(ret) => {
                if let Some(value) = &ret.value {
                    event.return_id = Some(value.id);
                    event.return_type = owned(&value.type_name);
                }
                event.raised = ret.raised;
            }
            EventRecord::Create(create) => {
                event.id = Some(create.id);
                event.type_name = owned(&create.type_tag);
            }
            EventRecord::Destroy(destroy) => {
                event.id = Some(destroy.id);
                event.type_name = owned(&destroy.type_tag);
                event.creation = destroy.creation.as_ref().map(JsonCreation::from);
            }
        }
        event
    }
}

fn describe(loc: &Location) -> String {
    if loc.is_unknown() {
        return "<unknown>".to_string();
    }
    format!(
        "{} ({}:{})",
        loc.func.as_deref().unwrap_or("?"),
        loc.file.as_deref().unwrap_or("?"),
        loc.line
    )
}

/// Encoder producing one line of text per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextEncoder;

impl EventEncoder for TextEncoder {
    type Event = String;

    fn encode_event(&self, index: usize, record: &EventRecord, errors: &mut OutputErrors) -> String {
        report_truncated_field_errors(index, record, errors);

        let mut line = format!("[w{}] {:<7} ", record.header().worker, record.kind().as_str());
        match record {
            EventRecord::Call(call) => {
                let args: Vec<String> = call
                    .args
                    .iter()
                    .map(|a| format!("{}: {}", a.name.as_deref().unwrap_or("?"), a.type_name.as_deref().unwrap_or("?")))
                    .collect();
                line.push_str(&format!("{}({})", describe(&call.location), args.join(", ")));
                if !call.caller.is_unknown() {
                    line.push_str(&format!(" from {}", describe(&call.caller)));
                }
            }
            EventRecord::Return(ret) => {
                line.push_str(&describe(&ret.location));
                match (&ret.value, ret.raised) {
                    (_, true) => line.push_str(" raised"),
                    (Some(v), false) => {
                        line.push_str(&format!(" -> {} #{:#x}", v.type_name.as_deref().unwrap_or("?"), v.id));
                    }
                    (None, false) => {}
                }
            }
            EventRecord::Create(create) => line.push_str(&format!(
                "{} #{:#x} at {}",
                create.type_tag.as_deref().unwrap_or("?"),
                create.id,
                describe(&create.location)
            )),
            EventRecord::Destroy(destroy) => {
                line.push_str(&format!(
                    "{} #{:#x} at {}",
                    destroy.type_tag.as_deref().unwrap_or("?"),
                    destroy.id,
                    describe(&destroy.location)
                ));
                if let Some(creation) = &destroy.creation {
                    line.push_str(&format!(" created at {}", describe(&creation.location)));
                }
            }
        }
        let field_errors = record.header().errors.errors.len();
        if field_errors > 0 {
            line.push_str(&format!(" ({field_errors} field errors)"));
        }
        line
    }
}

/// Report a record whose field-error list overflowed and lost entries.
fn report_truncated_field_errors(index: usize, record: &EventRecord, errors: &mut OutputErrors) {
    let truncated = record.header().errors.truncated;
    if truncated > 0 {
        errors.push(
            format!("events[{index}]"),
            "field_errors_truncated",
            format!("{truncated} field errors dropped after the first {MAX_FIELD_ERRORS}"),
        );
    }
}

/// Stream `records` to `writer` as JSON lines.
///
/// A record that fails to serialize or write is skipped and reported; the
/// export continues with the next one.
pub fn write_json_lines<W: Write>(mut writer: W, records: &[EventRecord]) -> OutputErrors {
    let encoder = JsonEncoder;
    let mut errors = OutputErrors::default();
    for (i, record) in records.iter().enumerate() {
        let event = encoder.encode_event(i, record, &mut errors);
        let context = || format!("events[{i}]");
        if let Err(err) = serde_json::to_writer(&mut writer, &event) {
            let kind = if err.is_io() { "io" } else { "serialize" };
            errors.push(context(), kind, err.to_string());
            continue;
        }
        if let Err(err) = writer.write_all(b"\n") {
            errors.push(context(), "io", err.to_string());
        }
    }
    if let Err(err) = writer.flush() {
        errors.push("flush", "io", err.to_string());
    }
    if !errors.is_empty() {
        tracing::warn!(errors = errors.total(), "JSON lines export had output errors");
    }
    errors
}
