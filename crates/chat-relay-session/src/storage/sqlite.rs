//! SQLite message storage (feature-gated).

use std::{fmt::Display, str::FromStr};

use async_trait::async_trait;
use chat_relay_core::{MessageRecord, MessageStore, NewMessage, StoreError, UserId};
use chrono::{DateTime, Utc};
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use uuid::Uuid;

const CREATE_MESSAGES: &str = "CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL,
    sender TEXT NOT NULL,
    receiver TEXT NOT NULL,
    message TEXT NOT NULL,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const CREATE_USER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_user_id ON messages (user_id)";

fn internal(e: impl Display) -> StoreError {
    StoreError::Internal(e.to_string())
}

/// SQLite message store.
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Connect to `database_url`, creating the file and schema if needed.
    ///
    /// # Errors
    /// Returns error if database connection or schema creation fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(internal)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(internal)?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool, creating the schema if needed.
    ///
    /// # Errors
    /// Returns error if schema creation fails.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_MESSAGES)
            .execute(&pool)
            .await
            .map_err(internal)?;
        sqlx::query(CREATE_USER_INDEX)
            .execute(&pool)
            .await
            .map_err(internal)?;
        Ok(Self { pool })
    }
}

fn record_from_row(row: &SqliteRow) -> Result<MessageRecord, StoreError> {
    let id: String = row.try_get("id").map_err(internal)?;
    let user_id: String = row.try_get("user_id").map_err(internal)?;
    let created_at: String = row.try_get("created_at").map_err(internal)?;
    let updated_at: String = row.try_get("updated_at").map_err(internal)?;

    Ok(MessageRecord {
        id: Uuid::parse_str(&id).map_err(internal)?,
        sender: row.try_get("sender").map_err(internal)?,
        receiver: row.try_get("receiver").map_err(internal)?,
        message: row.try_get("message").map_err(internal)?,
        user_id: UserId::new(user_id),
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(internal)
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn store(&self, msg: NewMessage) -> Result<MessageRecord, StoreError> {
        let record = MessageRecord::new(msg, Utc::now());

        sqlx::query(
            "INSERT INTO messages (id, sender, receiver, message, user_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(&record.sender)
        .bind(&record.receiver)
        .bind(&record.message)
        .bind(record.user_id.as_str())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(record)
    }

    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, sender, receiver, message, user_id, created_at, updated_at
             FROM messages WHERE user_id = ? ORDER BY rowid",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;

        rows.iter().map(record_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteMessageStore {
        // One connection: every `:memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteMessageStore::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_and_query_by_user() {
        let store = memory_store().await;
        let u1 = UserId::new("u1");

        let stored = store
            .store(NewMessage::new("me@c.us", "to123", "hi", u1.clone()))
            .await
            .unwrap();
        store
            .store(NewMessage::new("a@c.us", "me@c.us", "second", u1.clone()))
            .await
            .unwrap();
        store
            .store(NewMessage::new("b@c.us", "x@c.us", "other", UserId::new("u2")))
            .await
            .unwrap();

        let records = store.query_by_user(&u1).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, stored.id);
        assert_eq!(records[0].receiver, "to123");
        assert_eq!(records[0].created_at, stored.created_at);
        assert_eq!(records[1].message, "second");
    }

    #[tokio::test]
    async fn test_schema_creation_is_idempotent() {
        let store = memory_store().await;
        let again = SqliteMessageStore::from_pool(store.pool.clone()).await;
        assert!(again.is_ok());
    }
}
