use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chat_core::ChatMessage;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable chat history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists the message and returns it with its assigned id.
    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;

    /// Up to `limit` most recent messages, newest first.
    async fn recent(&self, limit: u32) -> Result<Vec<ChatMessage>, StoreError>;
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    username: String,
    message: String,
    server: String,
    timestamp: DateTime<Utc>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        ChatMessage {
            id: Some(row.id),
            username: row.username,
            content: row.message,
            server: row.server,
            timestamp: row.timestamp,
        }
    }
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(database = %url, "message store ready");
        Ok(store)
    }

    /// Single-connection in-memory database; the connection is pinned so the
    /// schema outlives idle periods.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (username, message, server, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(&message.username)
        .bind(&message.content)
        .bind(&message.server)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(message.with_id(result.last_insert_rowid()))
    }

    async fn recent(&self, limit: u32) -> Result<Vec<ChatMessage>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, username, message, server, timestamp FROM messages ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }
}

#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<ChatMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut messages = self.messages.lock().await;
        let stored = message.with_id(messages.len() as i64 + 1);
        messages.push(stored.clone());
        Ok(stored)
    }

    async fn recent(&self, limit: u32) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.lock().await;
        Ok(messages
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
