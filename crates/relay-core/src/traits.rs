//! Collaborator traits: persistence, the opaque protocol client, webhook lookup.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    event::{ProtocolEvent, QrEvent},
    session::{
        PayloadMode, ProxyConfig, Session, SessionFilter, SessionId, SessionStatus,
        WebhookSettings, event_enabled,
    },
};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session storage backends.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Persist a new session. Fails if the identifier is taken.
    async fn create(&self, session: &Session) -> Result<(), StorageError>;

    /// Get a session by ID.
    async fn get_by_id(&self, id: &SessionId) -> Result<Option<Session>, StorageError>;

    /// List sessions with optional filter.
    async fn get_all(&self, filter: &SessionFilter) -> Result<Vec<Session>, StorageError>;

    /// Update session status.
    async fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StorageError>;

    /// Update status and record the protocol address assigned at pairing.
    async fn update_status_and_address(
        &self,
        id: &SessionId,
        status: SessionStatus,
        address: &str,
    ) -> Result<(), StorageError>;

    /// Replace webhook settings.
    async fn update_webhook(&self, id: &SessionId, webhook: &WebhookSettings) -> Result<(), StorageError>;

    /// Replace (or clear) the outbound proxy.
    async fn update_proxy(&self, id: &SessionId, proxy: Option<&ProxyConfig>) -> Result<(), StorageError>;

    /// Remove a session. Removing an unknown session is not an error.
    async fn delete(&self, id: &SessionId) -> Result<(), StorageError>;
}

/// Protocol client error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Pairing failed: {0}")]
    Pairing(String),
    #[error("Client is not connected")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Other(String),
}

/// Callback registered on a protocol client.
pub type EventHandler = Box<dyn Fn(ProtocolEvent) + Send + Sync>;

/// The opaque messaging-protocol client owned by one session.
///
/// Encryption, multi-device sync and the wire codec live behind this trait.
/// Implementations invoke registered handlers one at a time per client.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open the protocol connection.
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Close the protocol connection.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    /// Register a callback for protocol events.
    fn add_event_handler(&self, handler: EventHandler);

    /// Address held by the device store; `None` until paired.
    fn address(&self) -> Option<String>;

    /// Open the pairing channel. Must be called before `connect` on an
    /// unpaired client.
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ProtocolError>;
}

/// Builds protocol clients for sessions.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Create a client bound to the session's device store and proxy.
    async fn create_client(&self, session: &Session) -> Result<Arc<dyn ProtocolClient>, ProtocolError>;
}

/// Delivery configuration resolved for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub url: String,
    pub events: Vec<String>,
    pub mode: PayloadMode,
    /// Paired protocol address, reported in raw payload metadata.
    pub address: Option<String>,
}

impl WebhookTarget {
    /// Resolve a target from stored settings. `None` when delivery is disabled.
    #[must_use]
    pub fn from_session(session: &Session) -> Option<Self> {
        if !session.webhook.is_enabled() {
            return None;
        }
        Some(Self {
            url: session.webhook.url.clone()?,
            events: session.webhook.events.clone(),
            mode: session.webhook.mode,
            address: session.address.clone(),
        })
    }

    /// Whether an event passes the enabled-event filter.
    #[must_use]
    pub fn accepts(&self, event_name: &str) -> bool {
        event_enabled(&self.events, event_name)
    }
}

/// Lookup of per-session webhook targets used by the delivery pipeline.
#[async_trait]
pub trait WebhookTargets: Send + Sync {
    async fn webhook_target(&self, id: &SessionId) -> Option<WebhookTarget>;
}
