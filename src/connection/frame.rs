//! Outbound frames and their Server-Sent-Events text form.

use crate::core::StateKey;
use crate::dispatch::DiffEvent;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

pub const EVENT_PATCH_SIGNALS: &str = "livestate-patch-signals";
pub const EVENT_PATCH_ELEMENTS: &str = "livestate-patch-elements";
pub const EVENT_RESYNC: &str = "livestate-resync";
pub const EVENT_CONNECTED: &str = "livestate-connected";
pub const EVENT_HEARTBEAT: &str = "livestate-heartbeat";

/// Everything a connection writes to its client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Connected { connection_id: Uuid },
    Diff(Arc<DiffEvent>),
    /// Events were lost; the client should re-fetch these keys.
    Resync { keys: Vec<StateKey>, missed: u64 },
    Heartbeat { seq: u64 },
}

/// One SSE event: name, optional id, and its `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: &'static str,
    pub id: Option<String>,
    pub data: Vec<String>,
}

impl SseEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            id: None,
            data: Vec::new(),
        }
    }

    fn id(mut self, id: String) -> Self {
        self.id = Some(id);
        self
    }

    fn line(mut self, line: impl Into<String>) -> Self {
        self.data.push(line.into());
        self
    }

    /// Text form, terminated by the blank line that ends an SSE event.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "event: {}", self.event);
        if let Some(id) = &self.id {
            let _ = writeln!(out, "id: {id}");
        }
        for line in &self.data {
            let _ = writeln!(out, "data: {line}");
        }
        out.push('\n');
        out
    }
}

impl OutboundFrame {
    pub fn to_sse_events(&self) -> Vec<SseEvent> {
        match self {
            OutboundFrame::Connected { connection_id } => vec![
                SseEvent::new(EVENT_CONNECTED)
                    .line(json!({ "connection_id": connection_id }).to_string()),
            ],
            OutboundFrame::Heartbeat { seq } => {
                vec![SseEvent::new(EVENT_HEARTBEAT).line(seq.to_string())]
            }
            OutboundFrame::Resync { keys, missed } => {
                let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
                vec![
                    SseEvent::new(EVENT_RESYNC)
                        .line(json!({ "keys": keys, "missed": missed }).to_string()),
                ]
            }
            OutboundFrame::Diff(diff) => diff_events(diff),
        }
    }

    pub fn encode_sse(&self) -> String {
        self.to_sse_events().iter().map(SseEvent::encode).collect()
    }
}

/// Signals first (when fields changed, or nothing else would be sent), then one event per fragment.
pub fn diff_events(diff: &DiffEvent) -> Vec<SseEvent> {
    let id = format!("{}@{}", diff.key, diff.version);
    let mut events = Vec::with_capacity(diff.fragments.len() + 1);

    if !diff.changed_fields.is_empty() || diff.fragments.is_empty() {
        events.push(
            SseEvent::new(EVENT_PATCH_SIGNALS)
                .id(id.clone())
                .line(format!("signals {}", diff.signals())),
        );
    }

    for fragment in &diff.fragments {
        let mut event = SseEvent::new(EVENT_PATCH_ELEMENTS).id(id.clone());
        if let Some(selector) = &fragment.selector {
            event = event.line(format!("selector {selector}"));
        }
        event = event.line(format!("mode {}", fragment.mode));
        for line in fragment.content.lines() {
            event = event.line(format!("elements {line}"));
        }
        events.push(event);
    }

    events
}
