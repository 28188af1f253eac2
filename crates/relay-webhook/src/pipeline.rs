//! Bounded delivery queue, worker pool and retry coordinator.
//!
//! ```text
//! WebhookSender --try_send--> queue --> worker x N --POST--> endpoint
//!                               ^                 |
//!                               |   (failure)     v
//!                         retry coordinator <-- retry channel
//! ```
//!
//! Enqueueing never blocks: a full queue is reported to the caller as
//! [`WebhookError::QueueFull`]. A full retry channel, or a coordinator
//! already holding `retry_capacity` payloads, drops the payload with a
//! warning.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use relay_core::DeliverySettings;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{backoff::backoff_delay, error::WebhookError, payload::WebhookPayload};

const USER_AGENT: &str = concat!("session-relay/", env!("CARGO_PKG_VERSION"));

/// Delivery counters shared by the pipeline tasks.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
    retry_dropped: AtomicU64,
    exhausted: AtomicU64,
    queue_full: AtomicU64,
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub failed_attempts: u64,
    pub retried: u64,
    pub retry_dropped: u64,
    pub exhausted: u64,
    pub queue_full: u64,
}

impl DeliveryStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            retry_dropped: self.retry_dropped.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Cloneable handle for enqueueing payloads.
#[derive(Clone)]
pub struct WebhookSender {
    tx: mpsc::Sender<WebhookPayload>,
    stats: Arc<DeliveryStats>,
}

impl WebhookSender {
    /// Enqueue without waiting.
    ///
    /// # Errors
    /// `QueueFull` when the queue is at capacity, `Closed` after shutdown.
    pub fn send(&self, payload: WebhookPayload) -> Result<(), WebhookError> {
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(payload)) => {
                bump(&self.stats.queue_full);
                warn!(
                    session_id = %payload.session_id,
                    event = %payload.event_name,
                    "webhook queue full"
                );
                Err(WebhookError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(WebhookError::Closed),
        }
    }
}

/// State shared by the workers.
struct Worker {
    client: reqwest::Client,
    settings: DeliverySettings,
    retry_tx: mpsc::Sender<WebhookPayload>,
    stats: Arc<DeliveryStats>,
}

struct Channels {
    queue_rx: mpsc::Receiver<WebhookPayload>,
    retry_rx: mpsc::Receiver<WebhookPayload>,
    retry_tx: mpsc::Sender<WebhookPayload>,
}

/// Webhook delivery pipeline.
pub struct DeliveryPipeline {
    settings: DeliverySettings,
    client: reqwest::Client,
    sender: WebhookSender,
    channels: Mutex<Option<Channels>>,
    stats: Arc<DeliveryStats>,
}

impl DeliveryPipeline {
    /// Build the queues and HTTP client. Nothing is delivered until
    /// [`start`](Self::start).
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(settings: DeliverySettings) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.request_timeout())
            .build()?;

        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (retry_tx, retry_rx) = mpsc::channel(settings.retry_capacity.max(1));
        let stats = Arc::new(DeliveryStats::default());

        Ok(Self {
            sender: WebhookSender {
                tx: queue_tx,
                stats: Arc::clone(&stats),
            },
            channels: Mutex::new(Some(Channels {
                queue_rx,
                retry_rx,
                retry_tx,
            })),
            settings,
            client,
            stats,
        })
    }

    #[must_use]
    pub fn sender(&self) -> WebhookSender {
        self.sender.clone()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the workers and the retry coordinator. Returns their handles,
    /// or an empty list if already started.
    pub fn start(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(channels) = self.channels.lock().take() else {
            warn!("webhook pipeline already started");
            return Vec::new();
        };

        let worker = Arc::new(Worker {
            client: self.client.clone(),
            settings: self.settings.clone(),
            retry_tx: channels.retry_tx,
            stats: Arc::clone(&self.stats),
        });
        let queue = Arc::new(tokio::sync::Mutex::new(channels.queue_rx));

        let workers = self.settings.workers.max(1);
        let mut handles = Vec::with_capacity(workers + 1);
        for index in 0..workers {
            handles.push(tokio::spawn(run_worker(
                index,
                Arc::clone(&queue),
                Arc::clone(&worker),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(run_retries(
            channels.retry_rx,
            self.sender.tx.clone(),
            RetryLimits {
                tick: self.settings.retry_tick(),
                capacity: self.settings.retry_capacity.max(1),
            },
            Arc::clone(&self.stats),
            cancel.clone(),
        )));

        info!(workers, "webhook pipeline started");
        handles
    }
}

async fn run_worker(
    index: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<WebhookPayload>>>,
    worker: Arc<Worker>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };
        let Some(payload) = next else { break };
        worker.deliver(payload).await;
    }
    debug!(worker = index, "webhook worker stopped");
}

impl Worker {
    async fn deliver(&self, mut payload: WebhookPayload) {
        let attempt = payload.retries + 1;
        let err = match self.post(&payload, attempt).await {
            Ok(()) => {
                bump(&self.stats.delivered);
                debug!(
                    session_id = %payload.session_id,
                    event = %payload.event_name,
                    attempt,
                    "webhook delivered"
                );
                return;
            }
            Err(err) => err,
        };
        bump(&self.stats.failed_attempts);

        if !err.is_retryable() || payload.retries >= self.settings.max_retries {
            bump(&self.stats.exhausted);
            let err = WebhookError::DeliveryExhausted {
                attempts: attempt,
                last_error: err.to_string(),
            };
            error!(
                session_id = %payload.session_id,
                event = %payload.event_name,
                url = %payload.target_url,
                error = %err,
                "webhook delivery failed permanently"
            );
            return;
        }

        payload.retries += 1;
        let delay = backoff_delay(
            payload.retries,
            self.settings.base_delay(),
            self.settings.max_delay(),
            self.settings.jitter_factor,
        );
        payload.last_error = Some(err.to_string());
        payload.next_retry_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));

        let session_id = payload.session_id.clone();
        match self.retry_tx.try_send(payload) {
            Ok(()) => {
                bump(&self.stats.retried);
                warn!(session_id = %session_id, error = %err, ?delay, "webhook delivery failed, retry scheduled");
            }
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                bump(&self.stats.retry_dropped);
                warn!(session_id = %session_id, error = %err, "retry queue unavailable, dropping webhook");
            }
        }
    }

    async fn post(&self, payload: &WebhookPayload, attempt: u32) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(&payload.target_url)
            .header("X-Webhook-Event", payload.event_name.as_str())
            .header("X-Session-Id", payload.session_id.as_str())
            .header("X-Payload-Type", payload.payload_type.as_str())
            .header("X-Webhook-Attempt", attempt.to_string())
            .header("X-Webhook-Delivery", payload.id.to_string())
            .json(&payload.data)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::DeliveryFailed {
                status: status.as_u16(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryLimits {
    tick: Duration,
    /// Most payloads held at once.
    capacity: usize,
}

/// Holds failed payloads until they are due, then puts them back on the
/// main queue. Payloads that do not fit stay pending for the next tick.
async fn run_retries(
    mut retry_rx: mpsc::Receiver<WebhookPayload>,
    queue_tx: mpsc::Sender<WebhookPayload>,
    limits: RetryLimits,
    stats: Arc<DeliveryStats>,
    cancel: CancellationToken,
) {
    let mut pending: Vec<WebhookPayload> = Vec::new();
    let mut ticker = tokio::time::interval(limits.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = retry_rx.recv() => match received {
                Some(payload) if pending.len() >= limits.capacity => {
                    bump(&stats.retry_dropped);
                    warn!(
                        session_id = %payload.session_id,
                        delivery_id = %payload.id,
                        pending = pending.len(),
                        "retry backlog full, dropping webhook"
                    );
                }
                Some(payload) => pending.push(payload),
                None => break,
            },
            _ = ticker.tick() => {
                let now = Utc::now();
                let mut waiting = Vec::with_capacity(pending.len());
                for payload in pending.drain(..) {
                    if !payload.is_due(now) {
                        waiting.push(payload);
                        continue;
                    }
                    match queue_tx.try_send(payload) {
                        Ok(()) => {}
                        Err(TrySendError::Full(payload)) => waiting.push(payload),
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
                pending = waiting;
            }
        }
    }

    if !pending.is_empty() {
        warn!(pending = pending.len(), "retry coordinator stopped with pending webhooks");
    }
}
