//! Progress and result events emitted by audit runs.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Severity of a run's terminal event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Receives run start, incremental progress and the terminal summary
pub trait EventSink {
    /// A run began; `max_count` is the number of bytes it expects to scan
    fn start(&mut self, event_type: &str, message: &str, max_count: u64);

    /// `delta` more bytes were scanned
    fn progress(&mut self, delta: u64);

    /// The run ended
    fn end(&mut self, message: &str, level: EventLevel);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn start(&mut self, _event_type: &str, _message: &str, _max_count: u64) {}
    fn progress(&mut self, _delta: u64) {}
    fn end(&mut self, _message: &str, _level: EventLevel) {}
}

/// One recorded run
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub short_msg: String,
    pub max_ct: u64,
    pub cur_ct: u64,
    pub end_msg: Option<String>,
    pub level: EventLevel,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditEvent {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// In-memory event list, exportable as JSON
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<AuditEvent>,
    next_id: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn last(&self) -> Option<&AuditEvent> {
        self.events.last()
    }

    fn open_event(&mut self) -> Option<&mut AuditEvent> {
        self.events.last_mut().filter(|e| !e.is_finished())
    }

    fn push(&mut self, event_type: &str, message: &str, max_count: u64) {
        self.next_id += 1;
        self.events.push(AuditEvent {
            id: self.next_id,
            event_type: event_type.to_string(),
            short_msg: message.to_string(),
            max_ct: max_count,
            cur_ct: 0,
            end_msg: None,
            level: EventLevel::Info,
            start_time: Utc::now(),
            end_time: None,
        });
    }

    /// All events as a pretty-printed JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.events)
    }
}

impl EventSink for EventLog {
    fn start(&mut self, event_type: &str, message: &str, max_count: u64) {
        self.push(event_type, message, max_count);
    }

    fn progress(&mut self, delta: u64) {
        if let Some(event) = self.open_event() {
            event.cur_ct += delta;
        }
    }

    fn end(&mut self, message: &str, level: EventLevel) {
        // A run that fails before starting still leaves a record
        if self.open_event().is_none() {
            self.push("AUDIT", message, 0);
        }
        if let Some(event) = self.open_event() {
            event.end_msg = Some(message.to_string());
            event.level = level;
            event.end_time = Some(Utc::now());
        }
    }
}
