//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use chrono::Utc;
use relay_core::{
    ProxyConfig, Session, SessionFilter, SessionId, SessionStatus, SessionStorage, StorageError,
    WebhookSettings,
};

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryStorage {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn modify(
        &self,
        id: &SessionId,
        apply: impl FnOnce(&mut Session),
    ) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        apply(session);
        session.updated_at = Utc::now();

        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn create(&self, session: &Session) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if sessions.contains_key(&session.id) {
            return Err(StorageError::AlreadyExists(session.id.clone()));
        }
        sessions.insert(session.id.clone(), session.clone());

        Ok(())
    }

    async fn get_by_id(&self, id: &SessionId) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }

    async fn get_all(&self, filter: &SessionFilter) -> Result<Vec<Session>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();

        // Sort by created_at descending
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StorageError> {
        self.modify(id, |s| s.status = status)
    }

    async fn update_status_and_address(
        &self,
        id: &SessionId,
        status: SessionStatus,
        address: &str,
    ) -> Result<(), StorageError> {
        self.modify(id, |s| {
            s.status = status;
            s.address = Some(address.to_owned());
        })
    }

    async fn update_webhook(&self, id: &SessionId, webhook: &WebhookSettings) -> Result<(), StorageError> {
        self.modify(id, |s| s.webhook = webhook.clone())
    }

    async fn update_proxy(&self, id: &SessionId, proxy: Option<&ProxyConfig>) -> Result<(), StorageError> {
        self.modify(id, |s| s.proxy = proxy.cloned())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(id);

        Ok(())
    }
}
