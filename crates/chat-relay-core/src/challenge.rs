//! Latest login challenge per user.

use dashmap::DashMap;

use crate::UserId;

/// Ephemeral store of the most recent login challenge per user.
///
/// Writes are last-write-wins. Each user's slot is locked independently.
#[derive(Debug, Default)]
pub struct ChallengeCache {
    entries: DashMap<UserId, String>,
}

impl ChallengeCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` as the current challenge, replacing any earlier one.
    pub fn store(&self, user_id: &UserId, value: impl Into<String>) {
        self.entries.insert(user_id.clone(), value.into());
    }

    /// Current challenge, if one is pending.
    #[must_use]
    pub fn get(&self, user_id: &UserId) -> Option<String> {
        self.entries.get(user_id).map(|v| v.value().clone())
    }

    /// Drop the pending challenge. Returns whether one was present.
    pub fn clear(&self, user_id: &UserId) -> bool {
        self.entries.remove(user_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
