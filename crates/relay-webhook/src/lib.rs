//! Webhook delivery pipeline for the session relay.
//!
//! Protocol events flow through three stages:
//! - `Dispatcher` - resolve the session's target, filter, build payloads
//! - `DeliveryPipeline` - bounded queue drained by a fixed worker pool
//! - Retry coordinator - re-enqueue failed payloads once their backoff elapses

pub mod backoff;
pub mod dispatcher;
pub mod error;
pub mod payload;
pub mod pipeline;

pub use backoff::{backoff_delay, backoff_delay_with_random};
pub use dispatcher::Dispatcher;
pub use error::WebhookError;
pub use payload::{PayloadType, RawMetadata, WebhookPayload, build_payloads};
pub use pipeline::{DeliveryPipeline, DeliveryStats, StatsSnapshot, WebhookSender};
