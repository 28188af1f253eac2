//! Session manager orchestrating protocol connections.
//!
//! Owns one protocol client per connected session and drives the
//! connect / pairing state machine:
//!
//! ```text
//! Disconnected -> Connecting -> QrPending -> Connected
//!                           \-> Connected (stored credentials)
//! any -> Error (connect failure) | Disconnected (disconnect, pairing timeout)
//! ```
//!
//! Protocol callbacks only push into a per-session channel; a task per
//! session drains it, so the rest of the manager never runs inside a
//! client callback.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use relay_core::{
    ClientFactory, InboundEvent, LifecycleEvent, LifecycleKind, PayloadMode, ProtocolClient,
    ProtocolError, ProtocolEvent, ProxyConfig, QrCodeData, QrEvent, Session, SessionConfig,
    SessionFilter, SessionId, SessionSettings, SessionStatus, SessionStorage, StorageError,
    WebhookSettings, WebhookTarget, WebhookTargets, is_valid_webhook_url,
};
use serde_json::{Value, json};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{cache::SessionCache, lifecycle::LifecycleBus};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(StorageError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),
    #[error("Session already connected: {0}")]
    AlreadyConnected(SessionId),
    #[error("Timed out waiting for pairing code: {0}")]
    Timeout(SessionId),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<StorageError> for ManagerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => Self::NotFound(id),
            StorageError::AlreadyExists(id) => Self::AlreadyExists(id),
            other => Self::Storage(other),
        }
    }
}

/// Result of [`SessionManager::connect_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Reconnected with stored credentials, or paired before a code was needed.
    Connected,
    /// The device must be paired; show this code to the user.
    QrCode(QrCodeData),
}

/// Active client state.
struct ActiveClient {
    client: Arc<dyn ProtocolClient>,
    pairing_tx: Option<oneshot::Sender<()>>,
    event_task: JoinHandle<()>,
}

struct Inner<S> {
    storage: S,
    factory: Arc<dyn ClientFactory>,
    cache: Arc<SessionCache>,
    bus: LifecycleBus,
    settings: SessionSettings,
    clients: RwLock<HashMap<SessionId, ActiveClient>>,
    qr_codes: RwLock<HashMap<SessionId, QrCodeData>>,
    error_counts: Mutex<HashMap<SessionId, u64>>,
    /// Serializes `connect_session` per session.
    connect_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    events_tx: mpsc::Sender<InboundEvent>,
    ingress_dropped: AtomicU64,
    cancel: CancellationToken,
}

/// Session manager for orchestrating protocol sessions.
pub struct SessionManager<S>
where
    S: SessionStorage + 'static,
{
    inner: Arc<Inner<S>>,
}

impl<S> Clone for SessionManager<S>
where
    S: SessionStorage + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> SessionManager<S>
where
    S: SessionStorage + 'static,
{
    /// Create a new session manager.
    ///
    /// Returns the manager and the receiving end of the normalized protocol
    /// event stream consumed by the webhook pipeline.
    #[must_use]
    pub fn new(
        storage: S,
        factory: Arc<dyn ClientFactory>,
        settings: SessionSettings,
    ) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer.max(1));
        let cache = Arc::new(SessionCache::new(settings.cache_ttl()));
        let bus = LifecycleBus::new(Arc::clone(&cache), &settings);

        let inner = Inner {
            storage,
            factory,
            cache,
            bus,
            settings,
            clients: RwLock::new(HashMap::new()),
            qr_codes: RwLock::new(HashMap::new()),
            error_counts: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
            events_tx,
            ingress_dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Start the lifecycle bus and the cache sweeper.
    pub fn start(&self) {
        let cancel = self.inner.cancel.child_token();
        let _ = self.inner.bus.start(cancel.clone());
        let _ = Arc::clone(&self.inner.cache)
            .spawn_sweeper(self.inner.settings.cache_sweep_interval(), cancel);
        info!("session manager started");
    }

    /// Token cancelled by [`shutdown`](Self::shutdown). Child tokens can
    /// govern other components, e.g. the webhook pipeline.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// The session cache.
    #[must_use]
    pub fn cache(&self) -> &SessionCache {
        &self.inner.cache
    }

    /// The lifecycle bus, for registering observers.
    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleBus {
        &self.inner.bus
    }

    /// Create a new session.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the identifier is taken.
    pub async fn create_session(
        &self,
        id: impl Into<SessionId>,
        config: SessionConfig,
    ) -> Result<Session, ManagerError> {
        let id = id.into();
        if id.as_str().trim().is_empty() {
            return Err(ManagerError::InvalidInput("session id must not be empty".into()));
        }
        if let Some(url) = config.webhook.url.as_deref() {
            validate_webhook_url(url)?;
        }
        if let Some(proxy) = &config.proxy {
            proxy
                .validate()
                .map_err(|e| ManagerError::InvalidInput(e.to_string()))?;
        }

        let session = Session::new(id.clone(), config);
        self.inner.storage.create(&session).await?;
        self.inner.cache.set(id.clone(), session.clone(), None);
        self.inner
            .bus
            .emit(LifecycleEvent::new(id.clone(), LifecycleKind::Created));

        info!(session_id = %id, "session created");
        Ok(session)
    }

    /// Get a session, from the cache when possible.
    ///
    /// # Errors
    /// Returns `NotFound` if the session does not exist.
    pub async fn get_session(&self, id: &SessionId) -> Result<Session, ManagerError> {
        self.inner.load(id).await
    }

    /// List persisted sessions. Results refresh the cache.
    ///
    /// # Errors
    /// Returns error if the storage query fails.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, ManagerError> {
        let sessions = self.inner.storage.get_all(filter).await?;
        for session in &sessions {
            self.inner.cache.set(session.id.clone(), session.clone(), None);
        }
        Ok(sessions)
    }

    /// Connect a session, pairing it first if it has no stored credentials.
    ///
    /// Blocks until the client is connected, a pairing code is available,
    /// or the configured QR timeout elapses.
    ///
    /// # Errors
    /// Returns `NotFound`, `AlreadyConnected`, `Timeout`, or the protocol
    /// error of a failed connect.
    pub async fn connect_session(&self, id: &SessionId) -> Result<ConnectOutcome, ManagerError> {
        let inner = &self.inner;
        let lock = inner.connect_lock(id);
        let _connecting = lock.lock().await;
        let session = inner.load_fresh(id).await?;

        if let Some(client) = inner.client(id) {
            if session.status.is_online() && client.is_connected() {
                return Err(ManagerError::AlreadyConnected(id.clone()));
            }
            if session.status == SessionStatus::QrPending {
                if let Some(qr) = inner.current_qr(id) {
                    return Ok(ConnectOutcome::QrCode(qr));
                }
            }
        }

        let client = Inner::ensure_client(&self.inner, &session).await?;
        inner
            .transition(id, SessionStatus::Connecting, LifecycleKind::Starting, Value::Null)
            .await?;

        if client.address().is_some() {
            info!(session_id = %id, "connecting with stored credentials");
            if let Err(e) = client.connect().await {
                inner.record_failure(id, &e).await;
                return Err(e.into());
            }
            inner
                .transition(id, SessionStatus::Connected, LifecycleKind::Connected, Value::Null)
                .await?;
            return Ok(ConnectOutcome::Connected);
        }

        Inner::pair(&self.inner, id, client).await
    }

    /// Disconnect a session. Safe to call on an already disconnected session.
    ///
    /// # Errors
    /// Returns `NotFound` if the session does not exist.
    pub async fn disconnect_session(&self, id: &SessionId) -> Result<Session, ManagerError> {
        let inner = &self.inner;
        inner.load(id).await?;

        if let Some(active) = inner.take_client(id) {
            if active.client.is_connected() {
                active.client.disconnect().await;
            }
            active.event_task.abort();
        }
        inner.qr_codes.write().remove(id);

        inner
            .transition(
                id,
                SessionStatus::Disconnected,
                LifecycleKind::Disconnected,
                json!({ "reason": "requested" }),
            )
            .await?;
        info!(session_id = %id, "session disconnected");
        inner.load(id).await
    }

    /// Delete a session, disconnecting it first.
    ///
    /// # Errors
    /// Returns `NotFound` if the session does not exist.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), ManagerError> {
        let inner = &self.inner;
        inner.load_fresh(id).await?;

        if let Some(active) = inner.take_client(id) {
            active.client.disconnect().await;
            active.event_task.abort();
        }
        inner.qr_codes.write().remove(id);
        inner.error_counts.lock().remove(id);
        inner.connect_locks.lock().remove(id);
        inner.cache.delete(id);

        inner.storage.delete(id).await?;
        inner
            .bus
            .emit(LifecycleEvent::new(id.clone(), LifecycleKind::Deleted));

        info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// Current pairing code, if one is pending and unexpired.
    ///
    /// # Errors
    /// Returns `NotFound` if the session does not exist.
    pub async fn get_qr_code(&self, id: &SessionId) -> Result<Option<QrCodeData>, ManagerError> {
        self.inner.load(id).await?;
        Ok(self.inner.current_qr(id))
    }

    /// Replace a session's webhook settings.
    ///
    /// # Errors
    /// Returns `NotFound` or `InvalidInput` for a malformed URL.
    pub async fn set_webhook(
        &self,
        id: &SessionId,
        url: Option<String>,
        events: Vec<String>,
        mode: PayloadMode,
    ) -> Result<Session, ManagerError> {
        let url = url.filter(|u| !u.trim().is_empty());
        if let Some(url) = url.as_deref() {
            validate_webhook_url(url)?;
        }
        let webhook = WebhookSettings { url, events, mode };
        self.inner.storage.update_webhook(id, &webhook).await?;
        debug!(session_id = %id, mode = mode.as_str(), "webhook updated");
        self.inner.load_fresh(id).await
    }

    /// Replace or clear a session's outbound proxy. Applies to the next client built.
    ///
    /// # Errors
    /// Returns `NotFound` or `InvalidInput` for a malformed proxy URL.
    pub async fn set_proxy(
        &self,
        id: &SessionId,
        proxy: Option<ProxyConfig>,
    ) -> Result<Session, ManagerError> {
        if let Some(proxy) = &proxy {
            proxy
                .validate()
                .map_err(|e| ManagerError::InvalidInput(e.to_string()))?;
        }
        self.inner.storage.update_proxy(id, proxy.as_ref()).await?;
        self.inner.load_fresh(id).await
    }

    /// Number of failed connect attempts recorded for a session.
    #[must_use]
    pub fn error_count(&self, id: &SessionId) -> u64 {
        self.inner.error_counts.lock().get(id).copied().unwrap_or(0)
    }

    /// Protocol events dropped because the webhook ingress was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.inner.ingress_dropped.load(Ordering::Relaxed)
    }

    /// Whether the manager holds a protocol client for the session.
    #[must_use]
    pub fn has_client(&self, id: &SessionId) -> bool {
        self.inner.clients.read().contains_key(id)
    }

    /// Stop background tasks and disconnect every live client.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let clients: Vec<(SessionId, ActiveClient)> = self.inner.clients.write().drain().collect();
        for (id, active) in clients {
            if active.client.is_connected() {
                active.client.disconnect().await;
            }
            active.event_task.abort();
            debug!(session_id = %id, "client disconnected on shutdown");
        }
        info!("session manager stopped");
    }
}

#[async_trait]
impl<S> WebhookTargets for SessionManager<S>
where
    S: SessionStorage + 'static,
{
    async fn webhook_target(&self, id: &SessionId) -> Option<WebhookTarget> {
        match self.inner.load(id).await {
            Ok(session) => WebhookTarget::from_session(&session),
            Err(e) => {
                debug!(session_id = %id, error = %e, "no webhook target");
                None
            }
        }
    }
}

impl<S> Inner<S>
where
    S: SessionStorage + 'static,
{
    async fn load(&self, id: &SessionId) -> Result<Session, ManagerError> {
        if let Some(session) = self.cache.get(id) {
            return Ok(session);
        }
        self.load_fresh(id).await
    }

    async fn load_fresh(&self, id: &SessionId) -> Result<Session, ManagerError> {
        let session = self
            .storage
            .get_by_id(id)
            .await?
            .ok_or_else(|| ManagerError::NotFound(id.clone()))?;
        self.cache.set(id.clone(), session.clone(), None);
        Ok(session)
    }

    fn connect_lock(&self, id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.connect_locks.lock().entry(id.clone()).or_default())
    }

    fn client(&self, id: &SessionId) -> Option<Arc<dyn ProtocolClient>> {
        self.clients.read().get(id).map(|a| Arc::clone(&a.client))
    }

    fn take_client(&self, id: &SessionId) -> Option<ActiveClient> {
        self.clients.write().remove(id)
    }

    fn current_qr(&self, id: &SessionId) -> Option<QrCodeData> {
        self.qr_codes
            .read()
            .get(id)
            .filter(|qr| !qr.is_expired(Utc::now()))
            .cloned()
    }

    /// Persist a status, mirror it in the cache and emit the matching event.
    async fn transition(
        &self,
        id: &SessionId,
        status: SessionStatus,
        kind: LifecycleKind,
        payload: Value,
    ) -> Result<(), ManagerError> {
        self.storage.update_status(id, status).await?;
        let event = LifecycleEvent::with_payload(id.clone(), kind, payload);
        self.mirror_status(id, status);
        self.bus.emit(event);
        Ok(())
    }

    /// Status change with no lifecycle kind of its own (`QrPending`).
    async fn set_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), ManagerError> {
        self.storage.update_status(id, status).await?;
        self.mirror_status(id, status);
        Ok(())
    }

    fn mirror_status(&self, id: &SessionId, status: SessionStatus) {
        if !self.cache.update_status(id, status) {
            debug!(session_id = %id, %status, "status written to storage only, cache miss");
        }
    }

    async fn record_failure(&self, id: &SessionId, error: &ProtocolError) {
        let count = {
            let mut counts = self.error_counts.lock();
            let count = counts.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(session_id = %id, error = %error, count, "connect failed");
        if let Err(e) = self
            .transition(
                id,
                SessionStatus::Error,
                LifecycleKind::Error,
                json!({ "error": error.to_string(), "errorCount": count }),
            )
            .await
        {
            error!(session_id = %id, error = %e, "failed to record connect failure");
        }
    }

    /// Reuse the session's client or build one and wire its callback to a
    /// per-session event task.
    async fn ensure_client(
        this: &Arc<Self>,
        session: &Session,
    ) -> Result<Arc<dyn ProtocolClient>, ManagerError> {
        if let Some(client) = this.client(&session.id) {
            return Ok(client);
        }

        let client = this.factory.create_client(session).await?;
        let (tx, rx) = mpsc::unbounded_channel::<ProtocolEvent>();
        client.add_event_handler(Box::new(move |event| {
            let _ = tx.send(event);
        }));

        let event_task = tokio::spawn(Self::run_events(Arc::clone(this), session.id.clone(), rx));
        let active = ActiveClient {
            client: Arc::clone(&client),
            pairing_tx: None,
            event_task,
        };
        let displaced = this.clients.write().insert(session.id.clone(), active);
        if let Some(previous) = displaced {
            warn!(session_id = %session.id, "replacing an existing protocol client");
            previous.event_task.abort();
            previous.client.disconnect().await;
        }
        Ok(client)
    }

    async fn run_events(
        this: Arc<Self>,
        id: SessionId,
        mut rx: mpsc::UnboundedReceiver<ProtocolEvent>,
    ) {
        loop {
            let event = tokio::select! {
                () = this.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let name = event.name().to_owned();
            let handled = AssertUnwindSafe(this.handle_protocol_event(&id, event))
                .catch_unwind()
                .await;
            if handled.is_err() {
                error!(session_id = %id, event = %name, "protocol event handler panicked");
            }
        }
        debug!(session_id = %id, "protocol event task stopped");
    }

    async fn handle_protocol_event(&self, id: &SessionId, event: ProtocolEvent) {
        let result = match &event {
            ProtocolEvent::PairSuccess { address } => self.on_paired(id, address).await,
            ProtocolEvent::Connected => {
                self.transition(id, SessionStatus::Connected, LifecycleKind::Connected, Value::Null)
                    .await
            }
            ProtocolEvent::LoggedOut { reason } => {
                self.qr_codes.write().remove(id);
                self.transition(
                    id,
                    SessionStatus::Disconnected,
                    LifecycleKind::Disconnected,
                    json!({ "reason": reason, "loggedOut": true }),
                )
                .await
            }
            ProtocolEvent::Disconnected => {
                self.transition(
                    id,
                    SessionStatus::Disconnected,
                    LifecycleKind::Disconnected,
                    Value::Null,
                )
                .await
            }
            ProtocolEvent::ConnectFailure { reason } => {
                self.record_failure(id, &ProtocolError::Connect(reason.clone()))
                    .await;
                Ok(())
            }
            ProtocolEvent::Message { .. } => Ok(()),
        };
        if let Err(e) = result {
            warn!(session_id = %id, event = event.name(), error = %e, "failed to apply protocol event");
        }

        self.forward(id, &event);
    }

    async fn on_paired(&self, id: &SessionId, address: &str) -> Result<(), ManagerError> {
        let current = self.load_fresh(id).await?;
        let repeated =
            current.status == SessionStatus::Connected && current.address.as_deref() == Some(address);
        if !repeated {
            self.storage
                .update_status_and_address(id, SessionStatus::Connected, address)
                .await?;
        }
        self.qr_codes.write().remove(id);
        if let Some(tx) = self
            .clients
            .write()
            .get_mut(id)
            .and_then(|a| a.pairing_tx.take())
        {
            let _ = tx.send(());
        }
        self.load_fresh(id).await?;
        self.bus.emit(LifecycleEvent::with_payload(
            id.clone(),
            LifecycleKind::Connected,
            json!({ "address": address }),
        ));
        info!(session_id = %id, address, "device paired");
        Ok(())
    }

    fn forward(&self, id: &SessionId, event: &ProtocolEvent) {
        match self
            .events_tx
            .try_send(InboundEvent::from_protocol(id.clone(), event))
        {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => {
                self.ingress_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = %id, event = %e.event_name, "webhook ingress full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %id, "webhook ingress closed");
            }
        }
    }

    /// Pairing sub-flow: wait for the first code, then leave a watcher
    /// running for the rest of the window.
    async fn pair(
        this: &Arc<Self>,
        id: &SessionId,
        client: Arc<dyn ProtocolClient>,
    ) -> Result<ConnectOutcome, ManagerError> {
        let mut qr_rx = match client.qr_channel().await {
            Ok(rx) => rx,
            Err(e) => {
                this.record_failure(id, &e).await;
                return Err(e.into());
            }
        };

        // Armed before connecting so an early PairSuccess is not missed.
        let (done_tx, mut done_rx) = oneshot::channel();
        match this.clients.write().get_mut(id) {
            Some(active) => active.pairing_tx = Some(done_tx),
            None => return Err(ManagerError::NotFound(id.clone())),
        }
        this.set_status(id, SessionStatus::QrPending).await?;

        if let Err(e) = client.connect().await {
            this.record_failure(id, &e).await;
            return Err(e.into());
        }

        let window = this.settings.qr_timeout();
        let first = tokio::select! {
            event = qr_rx.recv() => event,
            done = &mut done_rx => done.ok().map(|()| QrEvent::Success),
            () = tokio::time::sleep(window) => None,
        };

        match first {
            Some(QrEvent::Code { code, timeout }) => {
                let window = this.pairing_window(timeout);
                let qr = this.store_qr(id, code, window);
                tokio::spawn(Self::watch_pairing(
                    Arc::clone(this),
                    id.clone(),
                    client,
                    qr_rx,
                    done_rx,
                    window,
                ));
                Ok(ConnectOutcome::QrCode(qr))
            }
            Some(QrEvent::Success) => Ok(ConnectOutcome::Connected),
            Some(QrEvent::Error(reason)) => {
                let error = ProtocolError::Pairing(reason);
                this.fail_pairing(id, &client, &error).await;
                Err(error.into())
            }
            Some(QrEvent::Timeout) | None => {
                debug!(session_id = %id, "no pairing code received");
                this.abort_pairing(id, &client, "qr_timeout").await;
                Err(ManagerError::Timeout(id.clone()))
            }
        }
    }

    /// Window enforced for one code: its own lifetime, bounded by `qr_timeout`.
    fn pairing_window(&self, code_timeout: Duration) -> Duration {
        let limit = self.settings.qr_timeout();
        if code_timeout.is_zero() {
            limit
        } else {
            code_timeout.min(limit)
        }
    }

    fn store_qr(&self, id: &SessionId, code: String, window: Duration) -> QrCodeData {
        // Whole seconds, rounded up.
        let seconds = window.as_millis().div_ceil(1000).max(1);
        let qr = QrCodeData::new(code, u64::try_from(seconds).unwrap_or(u64::MAX));
        self.qr_codes.write().insert(id.clone(), qr.clone());
        debug!(session_id = %id, timeout_seconds = qr.timeout_seconds, "pairing code issued");
        qr
    }

    /// Follow the pairing channel until success, expiry, or shutdown.
    /// Each new code reopens the window.
    async fn watch_pairing(
        this: Arc<Self>,
        id: SessionId,
        client: Arc<dyn ProtocolClient>,
        mut qr_rx: mpsc::Receiver<QrEvent>,
        mut done_rx: oneshot::Receiver<()>,
        window: Duration,
    ) {
        let mut deadline = Instant::now() + window;
        loop {
            tokio::select! {
                () = this.cancel.cancelled() => return,
                _ = &mut done_rx => return,
                event = qr_rx.recv() => match event {
                    Some(QrEvent::Code { code, timeout }) => {
                        let window = this.pairing_window(timeout);
                        this.store_qr(&id, code, window);
                        deadline = Instant::now() + window;
                    }
                    Some(QrEvent::Success) => return,
                    Some(QrEvent::Error(reason)) => {
                        this.fail_pairing(&id, &client, &ProtocolError::Pairing(reason)).await;
                        return;
                    }
                    Some(QrEvent::Timeout) | None => {
                        this.abort_pairing(&id, &client, "qr_timeout").await;
                        return;
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    this.abort_pairing(&id, &client, "qr_timeout").await;
                    return;
                }
            }
        }
    }

    /// Release the client of an unfinished pairing. Returns `false`, leaving
    /// everything alone, when the session paired or moved on in the meantime.
    async fn release_pairing(&self, id: &SessionId, client: &Arc<dyn ProtocolClient>) -> bool {
        match self.storage.get_by_id(id).await {
            Ok(Some(session))
                if matches!(session.status, SessionStatus::QrPending | SessionStatus::Connecting) => {}
            Ok(_) => return false,
            Err(e) => {
                error!(session_id = %id, error = %e, "failed to load session while releasing pairing");
                return false;
            }
        }

        client.disconnect().await;
        let owned = self
            .clients
            .read()
            .get(id)
            .is_some_and(|a| Arc::ptr_eq(&a.client, client));
        if owned {
            if let Some(active) = self.take_client(id) {
                active.event_task.abort();
            }
        }
        self.qr_codes.write().remove(id);
        true
    }

    /// Pairing window closed without a scan.
    async fn abort_pairing(&self, id: &SessionId, client: &Arc<dyn ProtocolClient>, reason: &str) {
        if !self.release_pairing(id, client).await {
            return;
        }
        if let Err(e) = self
            .transition(
                id,
                SessionStatus::Disconnected,
                LifecycleKind::Disconnected,
                json!({ "reason": reason }),
            )
            .await
        {
            error!(session_id = %id, error = %e, "failed to record pairing timeout");
        }
        info!(session_id = %id, reason, "pairing abandoned");
    }

    /// The pairing channel reported an error.
    async fn fail_pairing(&self, id: &SessionId, client: &Arc<dyn ProtocolClient>, error: &ProtocolError) {
        if self.release_pairing(id, client).await {
            self.record_failure(id, error).await;
        }
    }
}

fn validate_webhook_url(url: &str) -> Result<(), ManagerError> {
    if is_valid_webhook_url(url) {
        Ok(())
    } else {
        Err(ManagerError::InvalidInput(format!("invalid webhook url: {url}")))
    }
}
