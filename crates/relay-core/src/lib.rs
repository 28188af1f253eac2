//! Core model and collaborator traits for the session relay.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` and friends - the session model
//! - Lifecycle and protocol event types
//! - Storage, protocol client and webhook lookup traits
//! - `RelayConfig` - configuration loading
//! - Tracing bootstrap

pub mod config;
pub mod event;
pub mod logging;
pub mod session;
pub mod traits;

pub use config::{DeliverySettings, RelayConfig, SessionSettings};
pub use event::{InboundEvent, LifecycleEvent, LifecycleKind, ProtocolEvent, QrEvent};
pub use session::{
    PayloadMode, ProxyConfig, QrCodeData, Session, SessionConfig, SessionFilter, SessionId,
    SessionStatus, WebhookSettings, is_valid_webhook_url,
};
pub use traits::{
    ClientFactory, EventHandler, ProtocolClient, ProtocolError, SessionStorage, StorageError,
    WebhookTarget, WebhookTargets,
};
