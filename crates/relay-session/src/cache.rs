//! TTL-based in-memory index of sessions.
//!
//! Entries are visible only while `now < expires_at`. Expired entries are
//! treated as misses by readers and evicted in bulk by a background sweep.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relay_core::{Session, SessionId, SessionStatus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct CacheEntry {
    session: Session,
    expires_at: Instant,
    last_seen: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counts reported by [`SessionCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub live: usize,
    pub expired: usize,
    /// Live entries grouped by status.
    pub by_status: HashMap<SessionStatus, usize>,
}

/// Thread-safe session cache.
pub struct SessionCache {
    entries: RwLock<HashMap<SessionId, CacheEntry>>,
    default_ttl: Duration,
}

impl SessionCache {
    /// Create a cache whose entries live for `default_ttl` unless told otherwise.
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Insert or replace an entry.
    pub fn set(&self, id: SessionId, session: Session, ttl: Option<Duration>) {
        let now = Instant::now();
        let entry = CacheEntry {
            session,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            last_seen: now,
        };
        self.entries.write().insert(id, entry);
    }

    /// Get a live entry. Expired entries are misses but stay until the sweep.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        let now = Instant::now();
        self.entries
            .read()
            .get(id)
            .filter(|e| e.is_live(now))
            .map(|e| e.session.clone())
    }

    /// Set the status of a live entry. Returns `false` on a miss.
    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> bool {
        self.write_status(id, status, Utc::now(), false)
    }

    /// Set the status of a live entry unless the entry was updated after `at`.
    ///
    /// Returns `true` when the status was written.
    pub fn apply_status(&self, id: &SessionId, status: SessionStatus, at: DateTime<Utc>) -> bool {
        self.write_status(id, status, at, true)
    }

    fn write_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        at: DateTime<Utc>,
        only_if_newer: bool,
    ) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id).filter(|e| e.is_live(now)) else {
            return false;
        };
        if only_if_newer && at < entry.session.updated_at {
            return false;
        }
        entry.session.status = status;
        entry.session.updated_at = at;
        entry.expires_at = now + self.default_ttl;
        entry.last_seen = now;
        true
    }

    /// Remove an entry.
    pub fn delete(&self, id: &SessionId) -> Option<Session> {
        self.entries.write().remove(id).map(|e| e.session)
    }

    /// All live sessions.
    #[must_use]
    pub fn list(&self) -> Vec<Session> {
        let now = Instant::now();
        self.entries
            .read()
            .values()
            .filter(|e| e.is_live(now))
            .map(|e| e.session.clone())
            .collect()
    }

    /// Extend the expiry of a live entry. Returns `false` on a miss.
    pub fn refresh(&self, id: &SessionId, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(id).filter(|e| e.is_live(now)) {
            Some(entry) => {
                entry.expires_at = now + ttl.unwrap_or(self.default_ttl);
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// When the entry was last written or refreshed.
    #[must_use]
    pub fn last_seen(&self, id: &SessionId) -> Option<Instant> {
        self.entries.read().get(id).map(|e| e.last_seen)
    }

    /// Entry counts by liveness and status.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut stats = CacheStats {
            total: entries.len(),
            ..CacheStats::default()
        };
        for entry in entries.values() {
            if entry.is_live(now) {
                stats.live += 1;
                *stats.by_status.entry(entry.session.status).or_default() += 1;
            } else {
                stats.expired += 1;
            }
        }
        stats
    }

    /// Evict every expired entry under a single write lock.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, "evicted expired session cache entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use relay_core::SessionConfig;

    use super::*;

    fn session(id: &str) -> Session {
        Session::new(id.into(), SessionConfig::default())
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_before_sweep() {
        let cache = SessionCache::new(Duration::from_secs(3600));
        cache.set("s1".into(), session("s1"), Some(Duration::from_millis(10)));
        assert!(cache.get(&"s1".into()).is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.get(&"s1".into()).is_none());
        let stats = cache.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.expired, 1);
        assert!(cache.list().is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_only_expired_entries() {
        let cache = SessionCache::new(Duration::from_secs(3600));
        cache.set("old".into(), session("old"), Some(Duration::from_millis(5)));
        cache.set("fresh".into(), session("fresh"), None);
        tokio::time::sleep(Duration::from_millis(15)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().total, 1);
        assert!(cache.get(&"fresh".into()).is_some());
    }

    #[test]
    fn update_status_and_stats_by_status() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set("a".into(), session("a"), None);
        cache.set("b".into(), session("b"), None);

        assert!(cache.update_status(&"a".into(), SessionStatus::Connected));
        assert!(!cache.update_status(&"missing".into(), SessionStatus::Connected));

        let stats = cache.stats();
        assert_eq!(stats.live, 2);
        assert_eq!(stats.by_status.get(&SessionStatus::Connected), Some(&1));
        assert_eq!(stats.by_status.get(&SessionStatus::Disconnected), Some(&1));
    }

    #[test]
    fn apply_status_ignores_older_writes() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set("a".into(), session("a"), None);
        let stale = Utc::now() - chrono::Duration::seconds(5);

        assert!(cache.update_status(&"a".into(), SessionStatus::QrPending));
        assert!(!cache.apply_status(&"a".into(), SessionStatus::Connecting, stale));
        assert_eq!(cache.get(&"a".into()).unwrap().status, SessionStatus::QrPending);

        assert!(cache.apply_status(&"a".into(), SessionStatus::Connected, Utc::now()));
        assert_eq!(cache.get(&"a".into()).unwrap().status, SessionStatus::Connected);
    }

    #[tokio::test]
    async fn refresh_extends_live_entries_only() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set("a".into(), session("a"), Some(Duration::from_millis(30)));
        cache.set("b".into(), session("b"), Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(cache.refresh(&"a".into(), Some(Duration::from_secs(60))));
        assert!(!cache.refresh(&"b".into(), None));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&"a".into()).is_some());
    }

    #[test]
    fn delete_removes_entry() {
        let cache = SessionCache::new(Duration::from_secs(60));
        cache.set("a".into(), session("a"), None);
        assert!(cache.delete(&"a".into()).is_some());
        assert!(cache.get(&"a".into()).is_none());
        assert!(cache.delete(&"a".into()).is_none());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let cache = Arc::new(SessionCache::new(Duration::from_secs(60)));
        cache.set("a".into(), session("a"), Some(Duration::from_millis(1)));
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&cache).spawn_sweeper(Duration::from_millis(5), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.stats().total, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
