//! Session model shared by the orchestrator, the cache and the storage backends.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Connection status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No live protocol connection (initial state).
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Waiting for the user to scan a pairing code.
    QrPending,
    /// Protocol connection is up.
    Connected,
    /// Connected with a logged-in device.
    Authenticated,
    /// Last connection attempt failed.
    Error,
}

impl SessionStatus {
    /// Whether the session holds a usable protocol connection.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }

    /// Stable lowercase name, as stored and serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "qr_pending" => Ok(Self::QrPending),
            "connected" => Ok(Self::Connected),
            "authenticated" => Ok(Self::Authenticated),
            "error" => Ok(Self::Error),
            other => Err(ParseError::Status(other.to_owned())),
        }
    }
}

/// Shape of the data delivered to a session's webhook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// Normalized, stable schema.
    #[default]
    Processed,
    /// Pass-through of the underlying protocol event.
    Raw,
    /// Deliver both shapes as independent payloads.
    Both,
}

impl PayloadMode {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Raw => "raw",
            Self::Both => "both",
        }
    }
}

impl FromStr for PayloadMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processed" => Ok(Self::Processed),
            "raw" => Ok(Self::Raw),
            "both" => Ok(Self::Both),
            _ => Err(ParseError::PayloadMode(s.to_owned())),
        }
    }
}

/// Error parsing one of the model enums from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown session status: {0}")]
    Status(String),
    #[error("unknown payload mode: {0}")]
    PayloadMode(String),
}

/// Event name matching every event.
pub const WILDCARD_EVENT: &str = "*";

/// Exact-name or wildcard match against an enabled-event list.
#[must_use]
pub fn event_enabled(events: &[String], event_name: &str) -> bool {
    events.iter().any(|e| e == WILDCARD_EVENT || e == event_name)
}

/// Per-session webhook delivery settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSettings {
    /// Target URL; delivery is disabled while unset.
    pub url: Option<String>,
    /// Enabled event names. `*` enables everything.
    #[serde(default)]
    pub events: Vec<String>,
    /// Payload shape(s) to deliver.
    #[serde(default)]
    pub mode: PayloadMode,
}

impl WebhookSettings {
    /// Whether an event with this name should be delivered.
    #[must_use]
    pub fn accepts(&self, event_name: &str) -> bool {
        event_enabled(&self.events, event_name)
    }

    /// Whether a target URL is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Outbound proxy used by a session's protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `socks5://10.0.0.1:1080`.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Rejected proxy configuration.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid proxy url: {0}")]
pub struct InvalidProxy(pub String);

const PROXY_SCHEMES: [&str; 3] = ["http", "https", "socks5"];
const WEBHOOK_SCHEMES: [&str; 2] = ["http", "https"];

/// Parse `raw` and require one of `schemes` plus a non-empty host.
fn parse_with_host(raw: &str, schemes: &[&str]) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    let has_host = url.host_str().is_some_and(|h| !h.is_empty());
    (schemes.contains(&url.scheme()) && has_host).then_some(url)
}

/// Whether `raw` is an absolute `http`/`https` URL with a host.
#[must_use]
pub fn is_valid_webhook_url(raw: &str) -> bool {
    parse_with_host(raw, &WEBHOOK_SCHEMES).is_some()
}

impl ProxyConfig {
    /// Create a proxy config without credentials.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    /// Check the URL has a supported scheme and a host.
    ///
    /// # Errors
    /// Returns [`InvalidProxy`] when the scheme is unsupported or the host is missing.
    pub fn validate(&self) -> Result<(), InvalidProxy> {
        parse_with_host(&self.url, &PROXY_SCHEMES)
            .map(|_| ())
            .ok_or_else(|| InvalidProxy(self.url.clone()))
    }
}

/// Options accepted when creating a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Display name; defaults to the identifier.
    pub name: Option<String>,
    pub webhook: WebhookSettings,
    pub proxy: Option<ProxyConfig>,
}

/// Filter for session listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions in this status.
    pub status: Option<SessionStatus>,
    /// Limit results.
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// Whether a session passes the status filter.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        self.status.is_none_or(|s| session.status == s)
    }
}

/// A logical, independently connectable messaging identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    /// Protocol address, assigned once the device is paired.
    pub address: Option<String>,
    pub webhook: WebhookSettings,
    pub proxy: Option<ProxyConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Build a fresh `Disconnected` session.
    #[must_use]
    pub fn new(id: SessionId, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            name: config.name.unwrap_or_else(|| id.to_string()),
            id,
            status: SessionStatus::Disconnected,
            address: None,
            webhook: config.webhook,
            proxy: config.proxy,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Pairing code handed to the user during the QR flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeData {
    pub code: String,
    pub timeout_seconds: u64,
    pub issued_at: DateTime<Utc>,
}

impl QrCodeData {
    #[must_use]
    pub fn new(code: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            code: code.into(),
            timeout_seconds,
            issued_at: Utc::now(),
        }
    }

    /// Whether the code can no longer be scanned.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let timeout = Duration::seconds(i64::try_from(self.timeout_seconds).unwrap_or(i64::MAX));
        self.issued_at
            .checked_add_signed(timeout)
            .is_none_or(|deadline| now >= deadline)
    }
}
