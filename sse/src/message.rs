//! Stream frames and the event envelope they carry.
//!
//! One frame is one SSE block:
//!
//! ```text
//! id: <event time in epoch milliseconds>
//! event: <event name>
//! data: <JSON envelope>
//!
//! ```
//!
//! Every line is optional. A keep-alive is a bare `event: ping`.

use crate::error::Error;
use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use events::{EventPayload, PublicEventKind, ScopeType};
use serde::Serialize;
use serde_json::json;

pub const PING_EVENT: &str = "ping";
pub const ERROR_EVENT: &str = "error";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
}

impl Frame {
    pub fn ping() -> Self {
        Self {
            event: Some(PING_EVENT.to_string()),
            ..Default::default()
        }
    }

    /// Terminal notice sent before a graceful close.
    pub fn error(message: &str) -> Self {
        Self {
            event: Some(ERROR_EVENT.to_string()),
            data: Some(json!({"type": ERROR_EVENT, "data": {"message": message}}).to_string()),
            ..Default::default()
        }
    }

    pub fn is_event(&self, name: &str) -> bool {
        self.event.as_deref() == Some(name)
    }

    /// Text form of this frame, terminated by the blank line.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        if let Some(event) = &self.event {
            out.push_str(&format!("event: {event}\n"));
        }
        if let Some(data) = &self.data {
            out.push_str(&format!("data: {data}\n"));
        }
        out.push('\n');
        out
    }
}

impl From<Frame> for Event {
    fn from(frame: Frame) -> Self {
        let mut event = Event::default();
        if let Some(id) = frame.id {
            event = event.id(id);
        }
        if let Some(name) = frame.event {
            event = event.event(name);
        }
        if let Some(data) = frame.data {
            event = event.data(data);
        }
        event
    }
}

/// What a client receives in the `data` line of an event frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: PublicEventKind,
    pub project_id: String,
    pub scope_type: ScopeType,
    pub time: Option<DateTime<Utc>>,
    pub data: EventPayload,
}

impl EventEnvelope {
    pub fn to_frame(&self) -> Result<Frame, Error> {
        Ok(Frame {
            id: self.time.map(|time| time.timestamp_millis().to_string()),
            event: Some(self.kind.as_str().to_string()),
            data: Some(serde_json::to_string(self)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use events::EventRecord;

    #[test]
    fn test_ping_frame_has_no_data_line() {
        assert_eq!(Frame::ping().to_wire(), "event: ping\n\n");
    }

    #[test]
    fn test_error_frame_carries_message() {
        let frame = Frame::error("access revoked");
        assert!(frame.is_event(ERROR_EVENT));
        assert!(frame.to_wire().starts_with("event: error\ndata: {"));

        let data: serde_json::Value = serde_json::from_str(frame.data.as_deref().unwrap()).unwrap();
        assert_eq!(data["type"], "error");
        assert_eq!(data["data"]["message"], "access revoked");
    }

    #[test]
    fn test_envelope_frame_uses_time_as_id() {
        let envelope = EventEnvelope {
            kind: PublicEventKind::Update,
            project_id: "p1".to_string(),
            scope_type: ScopeType::SecretManager,
            time: Some(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()),
            data: EventPayload::Single(EventRecord::new("/app", "dev")),
        };

        let frame = envelope.to_frame().unwrap();
        let wire = frame.to_wire();

        assert!(wire.starts_with("id: 1700000000123\nevent: update\ndata: {"));
        assert!(wire.ends_with("}\n\n"));
        let data: serde_json::Value = serde_json::from_str(frame.data.as_deref().unwrap()).unwrap();
        assert_eq!(data["type"], "update");
        assert_eq!(data["projectId"], "p1");
        assert_eq!(data["scopeType"], "secret-manager");
        assert_eq!(data["data"]["path"], "/app");
    }

    #[test]
    fn test_envelope_without_time_omits_id() {
        let envelope = EventEnvelope {
            kind: PublicEventKind::Create,
            project_id: "p1".to_string(),
            scope_type: ScopeType::Kms,
            time: None,
            data: EventPayload::Batch(vec![EventRecord::new("/", "dev")]),
        };

        let frame = envelope.to_frame().unwrap();
        assert!(frame.id.is_none());
        assert!(frame.to_wire().starts_with("event: create\n"));
    }
}
