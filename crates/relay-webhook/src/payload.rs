//! Webhook payload construction.
//!
//! Two body shapes exist. The processed body is a stable schema:
//!
//! ```json
//! { "event": "Message", "sessionId": "s1", "timestamp": "...", "data": {} }
//! ```
//!
//! The raw body passes the protocol event through untouched, wrapped with
//! metadata under a `raw` schema marker.

use chrono::{DateTime, Utc};
use relay_core::{InboundEvent, PayloadMode, SessionId, WebhookTarget};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

/// Schema marker of raw bodies.
pub const RAW_SCHEMA: &str = "raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Processed,
    Raw,
}

impl PayloadType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Raw => "raw",
        }
    }
}

/// Library identification reported in raw payload metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMetadata {
    pub library: String,
    pub protocol_version: String,
}

impl Default for RawMetadata {
    fn default() -> Self {
        Self {
            library: "session-relay".to_owned(),
            protocol_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// One delivery unit. Owned by the pipeline from enqueue until success or
/// exhaustion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Stable across retries, sent as `X-Webhook-Delivery`.
    pub id: Uuid,
    pub session_id: SessionId,
    pub event_name: String,
    pub payload_type: PayloadType,
    /// JSON body posted to the endpoint.
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub retries: u32,
    pub target_url: String,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WebhookPayload {
    fn new(event: &InboundEvent, target_url: &str, payload_type: PayloadType, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: event.session_id.clone(),
            event_name: event.event_name.clone(),
            payload_type,
            data,
            timestamp: event.timestamp,
            retries: 0,
            target_url: target_url.to_owned(),
            next_retry_at: None,
            last_error: None,
        }
    }

    /// Processed payload with the normalized event data.
    #[must_use]
    pub fn processed(event: &InboundEvent, target_url: &str) -> Self {
        let body = json!({
            "event": event.event_name,
            "sessionId": event.session_id,
            "timestamp": event.timestamp,
            "data": event.data,
        });
        Self::new(event, target_url, PayloadType::Processed, body)
    }

    /// Raw payload, or `None` when the event carries no raw data.
    #[must_use]
    pub fn raw(
        event: &InboundEvent,
        target_url: &str,
        address: Option<&str>,
        metadata: &RawMetadata,
    ) -> Option<Self> {
        let raw = event.raw_data.as_ref()?;
        let body = json!({
            "schema": RAW_SCHEMA,
            "event": event.event_name,
            "eventType": event.event_type,
            "sessionId": event.session_id,
            "timestamp": event.timestamp,
            "metadata": {
                "library": metadata.library,
                "protocolVersion": metadata.protocol_version,
                "sessionAddress": address,
            },
            "raw": raw,
        });
        Some(Self::new(event, target_url, PayloadType::Raw, body))
    }

    /// Whether a scheduled retry may go out at `now`. Payloads without a
    /// schedule are always due.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// Build the payloads a target's mode asks for.
///
/// `both` yields two independent payloads. Raw payloads are skipped with a
/// warning when the event has no raw data.
#[must_use]
pub fn build_payloads(
    event: &InboundEvent,
    target: &WebhookTarget,
    metadata: &RawMetadata,
) -> Vec<WebhookPayload> {
    let mut payloads = Vec::with_capacity(2);

    if matches!(target.mode, PayloadMode::Processed | PayloadMode::Both) {
        payloads.push(WebhookPayload::processed(event, &target.url));
    }
    if matches!(target.mode, PayloadMode::Raw | PayloadMode::Both) {
        match WebhookPayload::raw(event, &target.url, target.address.as_deref(), metadata) {
            Some(payload) => payloads.push(payload),
            None => warn!(
                session_id = %event.session_id,
                event = %event.event_name,
                "raw payload requested but event has no raw data"
            ),
        }
    }

    payloads
}
