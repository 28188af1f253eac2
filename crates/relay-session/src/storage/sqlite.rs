//! SQLite session storage (feature-gated).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
    ProxyConfig, Session, SessionFilter, SessionId, SessionStatus, SessionStorage, StorageError,
    WebhookSettings,
};
use sqlx::{
    Row,
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    address TEXT,
    webhook TEXT NOT NULL,
    proxy TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const COLUMNS: &str = "id, name, status, address, webhook, proxy, created_at, updated_at";

/// SQLite storage implementation.
///
/// Webhook and proxy settings are stored as JSON text, timestamps as RFC 3339.
pub struct SqliteStorage {
    pool: SqlitePool,
}

fn internal(e: impl std::fmt::Display) -> StorageError {
    StorageError::Internal(e.to_string())
}

impl SqliteStorage {
    /// Connect and create the schema if needed.
    ///
    /// # Errors
    /// Returns error if database connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        // An in-memory database exists per connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(internal)?;

        sqlx::query(SCHEMA).execute(&pool).await.map_err(internal)?;

        Ok(Self { pool })
    }

    async fn touch(&self, id: &SessionId, sql: &str, binds: Vec<Option<String>>) -> Result<(), StorageError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let result = query
            .bind(Utc::now().to_rfc3339())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(internal)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.clone()));
        }
        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(internal)
}

fn row_to_session(row: &SqliteRow) -> Result<Session, StorageError> {
    let status: String = row.try_get("status").map_err(internal)?;
    let webhook: String = row.try_get("webhook").map_err(internal)?;
    let proxy: Option<String> = row.try_get("proxy").map_err(internal)?;
    let created_at: String = row.try_get("created_at").map_err(internal)?;
    let updated_at: String = row.try_get("updated_at").map_err(internal)?;

    Ok(Session {
        id: SessionId::new(row.try_get::<String, _>("id").map_err(internal)?),
        name: row.try_get("name").map_err(internal)?,
        status: status.parse().map_err(internal)?,
        address: row.try_get("address").map_err(internal)?,
        webhook: serde_json::from_str(&webhook).map_err(internal)?,
        proxy: proxy
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(internal)?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    async fn create(&self, session: &Session) -> Result<(), StorageError> {
        let webhook = serde_json::to_string(&session.webhook).map_err(internal)?;
        let proxy = session
            .proxy
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(internal)?;

        let result = sqlx::query(
            "INSERT INTO sessions (id, name, status, address, webhook, proxy, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(session.id.as_str())
        .bind(&session.name)
        .bind(session.status.as_str())
        .bind(&session.address)
        .bind(webhook)
        .bind(proxy)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists(session.id.clone()));
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &SessionId) -> Result<Option<Session>, StorageError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;

        row.as_ref().map(row_to_session).transpose()
    }

    async fn get_all(&self, filter: &SessionFilter) -> Result<Vec<Session>, StorageError> {
        let mut sql = format!("SELECT {COLUMNS} FROM sessions");
        if filter.status.is_some() {
            sql.push_str(" WHERE status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query.fetch_all(&self.pool).await.map_err(internal)?;
        rows.iter().map(row_to_session).collect()
    }

    async fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<(), StorageError> {
        self.touch(
            id,
            "UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?",
            vec![Some(status.as_str().to_owned())],
        )
        .await
    }

    async fn update_status_and_address(
        &self,
        id: &SessionId,
        status: SessionStatus,
        address: &str,
    ) -> Result<(), StorageError> {
        self.touch(
            id,
            "UPDATE sessions SET status = ?, address = ?, updated_at = ? WHERE id = ?",
            vec![Some(status.as_str().to_owned()), Some(address.to_owned())],
        )
        .await
    }

    async fn update_webhook(&self, id: &SessionId, webhook: &WebhookSettings) -> Result<(), StorageError> {
        let webhook = serde_json::to_string(webhook).map_err(internal)?;
        self.touch(
            id,
            "UPDATE sessions SET webhook = ?, updated_at = ? WHERE id = ?",
            vec![Some(webhook)],
        )
        .await
    }

    async fn update_proxy(&self, id: &SessionId, proxy: Option<&ProxyConfig>) -> Result<(), StorageError> {
        let proxy = proxy.map(serde_json::to_string).transpose().map_err(internal)?;
        self.touch(
            id,
            "UPDATE sessions SET proxy = ?, updated_at = ? WHERE id = ?",
            vec![proxy],
        )
        .await
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }
}
