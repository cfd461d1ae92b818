//! In-memory message storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use chat_relay_core::{MessageRecord, MessageStore, NewMessage, StoreError, UserId};
use chrono::Utc;

/// In-memory message store.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
pub struct MemoryMessageStore {
    records: RwLock<HashMap<UserId, Vec<MessageRecord>>>,
}

impl MemoryMessageStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Total number of records across all users.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn record_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .values()
            .map(Vec::len)
            .sum())
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, msg: NewMessage) -> Result<MessageRecord, StoreError> {
        let record = MessageRecord::new(msg, Utc::now());

        self.records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .entry(record.user_id.clone())
            .or_default()
            .push(record.clone());

        Ok(record)
    }

    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_query_by_user() {
        let store = MemoryMessageStore::new();
        let u1 = UserId::new("u1");
        let u2 = UserId::new("u2");

        let first = store
            .store(NewMessage::new("me@c.us", "to123", "hi", u1.clone()))
            .await
            .unwrap();
        store
            .store(NewMessage::new("a@c.us", "me@c.us", "yo", u1.clone()))
            .await
            .unwrap();
        store
            .store(NewMessage::new("b@c.us", "x@c.us", "other", u2.clone()))
            .await
            .unwrap();

        assert_eq!(first.sender, "me@c.us");
        assert_eq!(first.created_at, first.updated_at);

        let records = store.query_by_user(&u1).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], first);
        assert_eq!(records[1].message, "yo");
        assert_eq!(store.query_by_user(&u2).await.unwrap().len(), 1);
        assert_eq!(store.record_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_user_is_empty() {
        let store = MemoryMessageStore::default();
        assert!(
            store
                .query_by_user(&UserId::new("nobody"))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
