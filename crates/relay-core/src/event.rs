//! Event types crossing component boundaries.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::SessionId;

/// Kind of session lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Created,
    Starting,
    Connected,
    Disconnected,
    Error,
    Deleted,
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Notification that a session's status changed. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub session_id: SessionId,
    pub kind: LifecycleKind,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Event with an empty payload, stamped now.
    #[must_use]
    pub fn new(session_id: SessionId, kind: LifecycleKind) -> Self {
        Self::with_payload(session_id, kind, Value::Null)
    }

    /// Event carrying extra detail (error text, address, ...).
    #[must_use]
    pub fn with_payload(session_id: SessionId, kind: LifecycleKind, payload: Value) -> Self {
        Self {
            session_id,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Events the opaque protocol client reports through its event handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Transport connected with stored credentials.
    Connected,
    /// Device pairing finished; the protocol assigned `address`.
    PairSuccess { address: String },
    /// The device was logged out remotely.
    LoggedOut { reason: String },
    /// Transport dropped.
    Disconnected,
    /// The server refused the connection.
    ConnectFailure { reason: String },
    /// Any other protocol event worth forwarding (messages, receipts, presence...).
    Message {
        event_type: String,
        data: Value,
        raw: Option<Value>,
    },
}

impl ProtocolEvent {
    /// Public event name used for webhook filtering.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Connected => "Connected",
            Self::PairSuccess { .. } => "PairSuccess",
            Self::LoggedOut { .. } => "LoggedOut",
            Self::Disconnected => "Disconnected",
            Self::ConnectFailure { .. } => "ConnectFailure",
            Self::Message { event_type, .. } => event_type,
        }
    }

    /// Normalized data for the processed payload.
    #[must_use]
    pub fn data(&self) -> Value {
        match self {
            Self::Connected | Self::Disconnected => Value::Object(serde_json::Map::new()),
            Self::PairSuccess { address } => serde_json::json!({ "address": address }),
            Self::LoggedOut { reason } | Self::ConnectFailure { reason } => {
                serde_json::json!({ "reason": reason })
            }
            Self::Message { data, .. } => data.clone(),
        }
    }

    /// Raw protocol representation, when the client supplied one.
    #[must_use]
    pub fn raw(&self) -> Option<Value> {
        match self {
            Self::Message { raw, .. } => raw.clone(),
            _ => None,
        }
    }
}

/// Items of the pairing channel opened during the QR flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEvent {
    /// A new code to display, valid for `timeout`.
    Code { code: String, timeout: Duration },
    Success,
    Timeout,
    Error(String),
}

/// Normalized protocol event on its way to the webhook pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub session_id: SessionId,
    pub event_name: String,
    /// Protocol-level type tag (the Rust-side variant or protocol type name).
    pub event_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    /// Normalize a protocol event for a session.
    #[must_use]
    pub fn from_protocol(session_id: SessionId, event: &ProtocolEvent) -> Self {
        let event_type = match event {
            ProtocolEvent::Message { event_type, .. } => format!("events.{event_type}"),
            other => format!("events.{}", other.name()),
        };
        Self {
            session_id,
            event_name: event.name().to_owned(),
            event_type,
            data: event.data(),
            raw_data: event.raw(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_events_keep_their_type_and_raw_data() {
        let event = ProtocolEvent::Message {
            event_type: "Message".into(),
            data: serde_json::json!({ "text": "hi" }),
            raw: Some(serde_json::json!({ "Info": { "ID": "ABC" } })),
        };
        let inbound = InboundEvent::from_protocol("s1".into(), &event);
        assert_eq!(inbound.event_name, "Message");
        assert_eq!(inbound.event_type, "events.Message");
        assert_eq!(inbound.data["text"], "hi");
        assert!(inbound.raw_data.is_some());
    }

    #[test]
    fn pair_success_exposes_address_without_raw() {
        let event = ProtocolEvent::PairSuccess {
            address: "5511999999999@x".into(),
        };
        let inbound = InboundEvent::from_protocol("s1".into(), &event);
        assert_eq!(inbound.event_name, "PairSuccess");
        assert_eq!(inbound.data["address"], "5511999999999@x");
        assert!(inbound.raw_data.is_none());
    }
}
