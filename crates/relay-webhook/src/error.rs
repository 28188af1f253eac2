//! Webhook delivery errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    /// The delivery queue is at capacity. The payload was not accepted.
    #[error("Webhook queue is full")]
    QueueFull,

    #[error("Endpoint answered with status {status}")]
    DeliveryFailed { status: u16 },

    #[error("Delivery abandoned after {attempts} attempts: {last_error}")]
    DeliveryExhausted { attempts: u32, last_error: String },

    #[error("Webhook pipeline is closed")]
    Closed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl WebhookError {
    /// Whether a later attempt may succeed. A request that cannot even be
    /// built will fail the same way every time.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeliveryFailed { .. } => true,
            Self::Http(e) => !e.is_builder(),
            _ => false,
        }
    }
}
