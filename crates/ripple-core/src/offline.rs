//! Offline message queue for Ripple.
//!
//! Messages that cannot be delivered live are appended to a durable,
//! per-user list and flushed back on the user's next connect. The queue is
//! at-least-once: a failed delivery leaves the list intact, and `clear` is
//! only called after the backlog has actually reached the client.

use async_trait::async_trait;
use dashmap::DashMap;
use ripple_protocol::types::now_millis;
use ripple_protocol::{ChatMessage, ConversationId, UserId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default sliding TTL for a user's queue: 7 days from the last write.
pub const DEFAULT_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Offline queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The durable store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A message could not be serialized for storage.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The durable list store consumed by the offline queue.
///
/// Modeled on the external key-value/queue store: ordered string lists
/// under string keys, with a per-key TTL. No transactional guarantee is
/// assumed across calls; the queue contract is built to tolerate that.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Append a value to the list at `key`.
    async fn push(&self, key: &str, value: String) -> Result<(), QueueError>;

    /// Read the list slice `[start, end]` (inclusive, `-1` meaning the
    /// last element).
    async fn range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>, QueueError>;

    /// Number of values in the list at `key`.
    async fn length(&self, key: &str) -> Result<usize, QueueError>;

    /// Reset the key's TTL.
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), QueueError>;

    /// Delete the key. Returns the number of keys removed.
    async fn delete(&self, key: &str) -> Result<u64, QueueError>;
}

/// In-memory [`OfflineStore`] for tests and single-box deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    lists: DashMap<String, StoredList>,
}

#[derive(Debug, Default)]
struct StoredList {
    values: Vec<String>,
    /// Expiry deadline in epoch milliseconds, if set.
    expires_at: Option<u64>,
}

impl StoredList {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| now_millis() >= at)
    }
}

impl MemoryStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_values(&self, key: &str) -> Vec<String> {
        match self.lists.get(key) {
            Some(list) if !list.is_expired() => list.values.clone(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn push(&self, key: &str, value: String) -> Result<(), QueueError> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        if list.is_expired() {
            list.values.clear();
            list.expires_at = None;
        }
        list.values.push(value);
        Ok(())
    }

    async fn range(&self, key: &str, start: i64, end: i64) -> Result<Vec<String>, QueueError> {
        let values = self.live_values(key);
        let len = values.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 {
                (len + i).max(0)
            } else {
                i
            }
        };
        let start = norm(start).min(len) as usize;
        let end = (norm(end) + 1).min(len) as usize;
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(values[start..end].to_vec())
    }

    async fn length(&self, key: &str) -> Result<usize, QueueError> {
        Ok(self.live_values(key).len())
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<(), QueueError> {
        if let Some(mut list) = self.lists.get_mut(key) {
            list.expires_at = Some(now_millis() + seconds * 1_000);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, QueueError> {
        Ok(u64::from(self.lists.remove(key).is_some()))
    }
}

/// Read-only aggregate over a user's queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Total queued messages.
    pub total: usize,
    /// Queued message counts keyed by conversation.
    pub per_conversation: HashMap<ConversationId, usize>,
}

/// Durable, per-user, FIFO-ish backlog of undelivered messages.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn OfflineStore>,
    ttl_seconds: u64,
}

impl OfflineQueue {
    /// Create a queue over the given store with the default 7-day TTL.
    #[must_use]
    pub fn new(store: Arc<dyn OfflineStore>) -> Self {
        Self::with_ttl(store, DEFAULT_TTL_SECONDS)
    }

    /// Create a queue with a custom sliding TTL.
    #[must_use]
    pub fn with_ttl(store: Arc<dyn OfflineStore>, ttl_seconds: u64) -> Self {
        Self { store, ttl_seconds }
    }

    fn key(user_id: &str) -> String {
        format!("offline:{user_id}")
    }

    /// Append a message to the user's queue and slide the key's TTL.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the store write fails; the
    /// caller must not report the message as delivered in that case.
    pub async fn enqueue(&self, user_id: &str, message: &ChatMessage) -> Result<(), QueueError> {
        let key = Self::key(user_id);
        let value = serde_json::to_string(message)?;
        self.store.push(&key, value).await?;
        // Sliding window: the whole queue expires relative to the last write
        self.store.expire(&key, self.ttl_seconds).await?;
        debug!(user = %user_id, message = %message.id, "Queued offline message");
        Ok(())
    }

    /// Read the user's full backlog, oldest first.
    ///
    /// The underlying store may not guarantee insertion order across
    /// pushes, so entries are re-sorted by `created_at`. Undecodable
    /// entries are skipped with a warning. The queue is NOT cleared here;
    /// call [`clear`](Self::clear) only after the backlog was delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn drain(&self, user_id: &str) -> Result<Vec<ChatMessage>, QueueError> {
        let raw = self.store.range(&Self::key(user_id), 0, -1).await?;

        let mut messages: Vec<ChatMessage> = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str(&entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Skipping undecodable queued message");
                }
            }
        }
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    /// Delete the user's queue. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails.
    pub async fn clear(&self, user_id: &str) -> Result<(), QueueError> {
        self.store.delete(&Self::key(user_id)).await?;
        Ok(())
    }

    /// Read-only aggregate of the user's queue. No side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn stats_for(&self, user_id: &str) -> Result<QueueStats, QueueError> {
        let messages = self.drain(user_id).await?;
        let mut per_conversation: HashMap<ConversationId, usize> = HashMap::new();
        for message in &messages {
            *per_conversation
                .entry(message.conversation_id.clone())
                .or_default() += 1;
        }
        Ok(QueueStats {
            total: messages.len(),
            per_conversation,
        })
    }

    /// Number of queued messages for a user, without decoding them.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn len(&self, user_id: &str) -> Result<usize, QueueError> {
        self.store.length(&Self::key(user_id)).await
    }
}

/// Queue a message for each of the given users.
///
/// Per-user failures are logged and returned; successfully queued users are
/// unaffected (at-least-once, never silently lose).
pub async fn enqueue_for(
    queue: &OfflineQueue,
    users: &[UserId],
    message: &ChatMessage,
) -> Vec<(UserId, QueueError)> {
    let mut failures = Vec::new();
    for user in users {
        if let Err(e) = queue.enqueue(user, message).await {
            warn!(user = %user, error = %e, "Failed to queue offline message");
            failures.push((user.clone(), e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_protocol::types::unique_id;
    use ripple_protocol::MessageType;

    fn message(conversation: &str, sender: &str, content: &str, created_at: u64) -> ChatMessage {
        ChatMessage {
            id: unique_id("msg"),
            conversation_id: conversation.to_string(),
            sender_id: sender.to_string(),
            message_type: MessageType::Text,
            content: content.to_string(),
            media_refs: Vec::new(),
            reply_to_id: None,
            created_at,
            sender_summary: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_drain_order() {
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()));

        queue.enqueue("bob", &message("c1", "alice", "m1", 100)).await.unwrap();
        queue.enqueue("bob", &message("c1", "alice", "m2", 200)).await.unwrap();
        queue.enqueue("bob", &message("c1", "alice", "m3", 300)).await.unwrap();

        let drained = queue.drain("bob").await.unwrap();
        let contents: Vec<&str> = drained.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);

        // Drain does not clear
        assert_eq!(queue.len("bob").await.unwrap(), 3);

        queue.clear("bob").await.unwrap();
        assert!(queue.drain("bob").await.unwrap().is_empty());
        // Clear is idempotent
        queue.clear("bob").await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_sorts_by_created_at() {
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()));

        queue.enqueue("bob", &message("c1", "alice", "late", 900)).await.unwrap();
        queue.enqueue("bob", &message("c1", "alice", "early", 100)).await.unwrap();

        let drained = queue.drain("bob").await.unwrap();
        assert_eq!(drained[0].content, "early");
        assert_eq!(drained[1].content, "late");
    }

    #[tokio::test]
    async fn test_drain_skips_undecodable_entries() {
        let store = Arc::new(MemoryStore::new());
        store.push("offline:bob", "not json".into()).await.unwrap();

        let queue = OfflineQueue::new(store);
        queue.enqueue("bob", &message("c1", "alice", "ok", 100)).await.unwrap();

        let drained = queue.drain("bob").await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].content, "ok");
    }

    #[tokio::test]
    async fn test_stats_for() {
        let queue = OfflineQueue::new(Arc::new(MemoryStore::new()));

        queue.enqueue("bob", &message("c1", "alice", "a", 1)).await.unwrap();
        queue.enqueue("bob", &message("c1", "alice", "b", 2)).await.unwrap();
        queue.enqueue("bob", &message("c2", "carol", "c", 3)).await.unwrap();

        let stats = queue.stats_for("bob").await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.per_conversation["c1"], 2);
        assert_eq!(stats.per_conversation["c2"], 1);

        // Read-only: the queue is untouched
        assert_eq!(queue.len("bob").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        let store = MemoryStore::new();
        store.push("k", "v".into()).await.unwrap();
        store.expire("k", 0).await.unwrap();

        assert_eq!(store.length("k").await.unwrap(), 0);
        assert!(store.range("k", 0, -1).await.unwrap().is_empty());

        // A fresh push after expiry starts a clean list
        store.push("k", "v2".into()).await.unwrap();
        assert_eq!(store.range("k", 0, -1).await.unwrap(), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_memory_store_range_bounds() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.push("k", format!("v{i}")).await.unwrap();
        }

        assert_eq!(store.range("k", 0, -1).await.unwrap().len(), 5);
        assert_eq!(store.range("k", 1, 2).await.unwrap(), vec!["v1", "v2"]);
        assert_eq!(store.range("k", -2, -1).await.unwrap(), vec!["v3", "v4"]);
        assert!(store.range("k", 4, 1).await.unwrap().is_empty());
    }
}
