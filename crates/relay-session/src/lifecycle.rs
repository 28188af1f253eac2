//! Lifecycle event bus.
//!
//! A single consumer task drains a bounded channel of [`LifecycleEvent`]s.
//! For each event it writes the cache status derived from the event kind,
//! records per-session activity, then runs the handlers registered for that
//! kind in registration order. Emitters never block: a full channel drops
//! the event with a warning.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use relay_core::{LifecycleEvent, LifecycleKind, SessionId, SessionSettings, SessionStatus};
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::SessionCache;

/// Error returned by a lifecycle handler. Logged, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Observer invoked for every event of the kind it was registered for.
pub type LifecycleHandler = Arc<dyn Fn(&LifecycleEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Last known activity of a session, as seen by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionActivity {
    pub last_kind: LifecycleKind,
    pub last_event_at: Instant,
    pub events: u64,
}

/// Counters reported by [`LifecycleBus::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub emitted: u64,
    pub processed: u64,
    pub dropped: u64,
    pub tracked_sessions: usize,
}

/// Cache status implied by an event kind. `Deleted` has none: it evicts.
#[must_use]
pub const fn status_for(kind: LifecycleKind) -> Option<SessionStatus> {
    match kind {
        LifecycleKind::Created | LifecycleKind::Disconnected => Some(SessionStatus::Disconnected),
        LifecycleKind::Starting => Some(SessionStatus::Connecting),
        LifecycleKind::Connected => Some(SessionStatus::Connected),
        LifecycleKind::Error => Some(SessionStatus::Error),
        LifecycleKind::Deleted => None,
    }
}

struct Shared {
    cache: Arc<SessionCache>,
    handlers: RwLock<HashMap<LifecycleKind, Vec<LifecycleHandler>>>,
    activity: Mutex<HashMap<SessionId, SessionActivity>>,
    emitted: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

/// Serializes session state transitions and fans them out to observers.
pub struct LifecycleBus {
    tx: mpsc::Sender<LifecycleEvent>,
    rx: Mutex<Option<mpsc::Receiver<LifecycleEvent>>>,
    shared: Arc<Shared>,
    sweep_interval: Duration,
    inactivity_threshold: Duration,
}

impl LifecycleBus {
    /// Create a bus writing statuses into `cache`. Call [`start`](Self::start)
    /// to begin processing.
    #[must_use]
    pub fn new(cache: Arc<SessionCache>, settings: &SessionSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.lifecycle_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            shared: Arc::new(Shared {
                cache,
                handlers: RwLock::new(HashMap::new()),
                activity: Mutex::new(HashMap::new()),
                emitted: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            sweep_interval: settings.activity_sweep_interval(),
            inactivity_threshold: settings.inactivity_threshold(),
        }
    }

    /// Register a handler for one kind. Takes effect for the next event processed.
    pub fn on<F>(&self, kind: LifecycleKind, handler: F)
    where
        F: Fn(&LifecycleEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Queue an event without blocking. Dropped with a warning when the
    /// channel is full or the consumer has stopped.
    pub fn emit(&self, event: LifecycleEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.shared.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %event.session_id,
                    kind = %event.kind,
                    "lifecycle channel full, dropping event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %event.session_id,
                    kind = %event.kind,
                    "lifecycle bus stopped, dropping event"
                );
            }
        }
    }

    /// Spawn the consumer and the activity sweep. Returns `None` if already started.
    pub fn start(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("lifecycle bus already started");
            return None;
        };

        let sweeper = Arc::clone(&self.shared);
        let (interval, threshold) = (self.sweep_interval, self.inactivity_threshold);
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = sweeper.sweep_inactive(threshold);
                        if removed > 0 {
                            debug!(removed, "dropped inactive lifecycle state");
                        }
                    }
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => shared.process(&event),
                        None => break,
                    },
                }
            }
            debug!("lifecycle bus stopped");
        }))
    }

    /// Activity recorded for a session.
    #[must_use]
    pub fn activity(&self, id: &SessionId) -> Option<SessionActivity> {
        self.shared.activity.lock().get(id).copied()
    }

    /// Forget activity idle for longer than `threshold`.
    pub fn sweep_inactive(&self, threshold: Duration) -> usize {
        self.shared.sweep_inactive(threshold)
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            emitted: self.shared.emitted.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            tracked_sessions: self.shared.activity.lock().len(),
        }
    }
}

impl Shared {
    fn process(&self, event: &LifecycleEvent) {
        let id = &event.session_id;
        match status_for(event.kind) {
            Some(status) => {
                self.cache.apply_status(id, status, event.timestamp);
            }
            None => {
                self.cache.delete(id);
            }
        }

        {
            let mut activity = self.activity.lock();
            if event.kind == LifecycleKind::Deleted {
                activity.remove(id);
            } else {
                let entry = activity.entry(id.clone()).or_insert(SessionActivity {
                    last_kind: event.kind,
                    last_event_at: Instant::now(),
                    events: 0,
                });
                entry.last_kind = event.kind;
                entry.last_event_at = Instant::now();
                entry.events += 1;
            }
        }

        let handlers = self.handlers.read().get(&event.kind).cloned().unwrap_or_default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(session_id = %id, kind = %event.kind, error = %e, "lifecycle handler failed");
                }
                Err(_) => {
                    error!(session_id = %id, kind = %event.kind, "lifecycle handler panicked");
                }
            }
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn sweep_inactive(&self, threshold: Duration) -> usize {
        let now = Instant::now();
        let mut activity = self.activity.lock();
        let before = activity.len();
        activity.retain(|_, a| now.duration_since(a.last_event_at) <= threshold);
        before - activity.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use relay_core::{Session, SessionConfig};

    use super::*;

    fn settings(capacity: usize) -> SessionSettings {
        SessionSettings {
            lifecycle_capacity: capacity,
            ..SessionSettings::default()
        }
    }

    async fn wait_processed(bus: &LifecycleBus, n: u64) {
        for _ in 0..200 {
            if bus.stats().processed >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bus processed only {} events", bus.stats().processed);
    }

    fn cached(id: &str) -> Arc<SessionCache> {
        let cache = Arc::new(SessionCache::new(Duration::from_secs(60)));
        cache.set(id.into(), Session::new(id.into(), SessionConfig::default()), None);
        cache
    }

    #[tokio::test]
    async fn duplicate_connected_events_invoke_handlers_each_time() {
        let cache = cached("s1");
        let bus = LifecycleBus::new(Arc::clone(&cache), &settings(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.on(LifecycleKind::Connected, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let _consumer = bus.start(CancellationToken::new());

        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Connected));
        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Connected));
        wait_processed(&bus, 2).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&"s1".into()).unwrap().status, SessionStatus::Connected);
        assert_eq!(bus.activity(&"s1".into()).unwrap().events, 2);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_and_errors_do_not_stop_others() {
        let cache = cached("s1");
        let bus = LifecycleBus::new(cache, &settings(16));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        bus.on(LifecycleKind::Error, move |_| {
            first.lock().push("first");
            Err("boom".into())
        });
        bus.on(LifecycleKind::Error, |_| panic!("handler bug"));
        let third = Arc::clone(&order);
        bus.on(LifecycleKind::Error, move |_| {
            third.lock().push("third");
            Ok(())
        });
        let _consumer = bus.start(CancellationToken::new());

        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Error));
        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Error));
        wait_processed(&bus, 2).await;

        assert_eq!(*order.lock(), vec!["first", "third", "first", "third"]);
    }

    #[tokio::test]
    async fn late_handler_sees_only_later_events() {
        let cache = cached("s1");
        let bus = LifecycleBus::new(cache, &settings(16));
        let _consumer = bus.start(CancellationToken::new());

        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Starting));
        wait_processed(&bus, 1).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(LifecycleKind::Starting, move |e| {
            sink.lock().push(e.payload.clone());
            Ok(())
        });
        bus.emit(LifecycleEvent::with_payload(
            "s1".into(),
            LifecycleKind::Starting,
            serde_json::json!(1),
        ));
        bus.emit(LifecycleEvent::with_payload(
            "s1".into(),
            LifecycleKind::Starting,
            serde_json::json!(2),
        ));
        wait_processed(&bus, 3).await;

        assert_eq!(*seen.lock(), vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let cache = cached("s1");
        let bus = LifecycleBus::new(cache, &settings(2));

        for _ in 0..5 {
            bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Starting));
        }

        let stats = bus.stats();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.dropped, 3);
    }

    #[tokio::test]
    async fn deleted_evicts_cache_and_activity() {
        let cache = cached("s1");
        let bus = LifecycleBus::new(Arc::clone(&cache), &settings(16));
        let _consumer = bus.start(CancellationToken::new());

        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Starting));
        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Deleted));
        wait_processed(&bus, 2).await;

        assert!(cache.get(&"s1".into()).is_none());
        assert!(bus.activity(&"s1".into()).is_none());
    }

    #[tokio::test]
    async fn sweep_forgets_idle_sessions() {
        let cache = cached("s1");
        let bus = LifecycleBus::new(cache, &settings(16));
        let _consumer = bus.start(CancellationToken::new());

        bus.emit(LifecycleEvent::new("s1".into(), LifecycleKind::Connected));
        wait_processed(&bus, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(bus.sweep_inactive(Duration::from_secs(60)), 0);
        assert_eq!(bus.sweep_inactive(Duration::from_millis(5)), 1);
        assert_eq!(bus.stats().tracked_sessions, 0);
    }

    #[tokio::test]
    async fn start_twice_is_refused() {
        let bus = LifecycleBus::new(cached("s1"), &settings(4));
        assert!(bus.start(CancellationToken::new()).is_some());
        assert!(bus.start(CancellationToken::new()).is_none());
    }
}
