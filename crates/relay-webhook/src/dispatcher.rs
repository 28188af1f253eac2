//! Ingress dispatch: protocol events in, webhook payloads out.

use std::sync::Arc;

use relay_core::{InboundEvent, WebhookTargets};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::WebhookError,
    payload::{RawMetadata, build_payloads},
    pipeline::WebhookSender,
};

/// Resolves each event's webhook target and enqueues its payloads.
pub struct Dispatcher {
    targets: Arc<dyn WebhookTargets>,
    sender: WebhookSender,
    metadata: RawMetadata,
}

impl Dispatcher {
    #[must_use]
    pub fn new(targets: Arc<dyn WebhookTargets>, sender: WebhookSender) -> Self {
        Self {
            targets,
            sender,
            metadata: RawMetadata::default(),
        }
    }

    /// Override the library metadata reported in raw payloads.
    #[must_use]
    pub fn with_metadata(mut self, metadata: RawMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Enqueue the payloads for one event. Returns how many were enqueued;
    /// zero when the session has no webhook or filters the event out.
    ///
    /// # Errors
    /// `QueueFull` or `Closed` from the delivery queue.
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<usize, WebhookError> {
        let Some(target) = self.targets.webhook_target(&event.session_id).await else {
            debug!(session_id = %event.session_id, "no webhook configured, dropping event");
            return Ok(0);
        };
        if !target.accepts(&event.event_name) {
            debug!(session_id = %event.session_id, event = %event.event_name, "event filtered out");
            return Ok(0);
        }

        let payloads = build_payloads(event, &target, &self.metadata);
        let count = payloads.len();
        for payload in payloads {
            self.sender.send(payload)?;
        }
        Ok(count)
    }

    /// Drain `events` until it closes or `cancel` fires.
    pub fn spawn(self, mut events: mpsc::Receiver<InboundEvent>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = self.dispatch(&event).await {
                    warn!(
                        session_id = %event.session_id,
                        event = %event.event_name,
                        error = %e,
                        "failed to enqueue webhook"
                    );
                }
            }
            debug!("webhook dispatcher stopped");
        })
    }
}
