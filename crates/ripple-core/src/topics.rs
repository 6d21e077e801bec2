//! Topic membership for Ripple.
//!
//! A topic is the broadcast scope of one conversation. Membership is a set
//! of user ids, process-local and ephemeral: it is not persisted and is
//! rebuilt by clients re-issuing `join` after a reconnect. A member without
//! a live connection stays in the set — chat fan-out uses that to know who
//! needs offline queuing — and the set is reset when the user is admitted
//! again (see `Relay::connect`).

use crate::registry::Registry;
use dashmap::{DashMap, DashSet};
use ripple_protocol::{ConversationId, Event, UserId};
use thiserror::Error;
use tracing::{debug, trace};

/// A topic identifier; identical to the conversation identifier it scopes.
pub type TopicId = ConversationId;

/// Topic membership errors.
#[derive(Debug, Error)]
pub enum TopicError {
    /// Maximum number of topics reached.
    #[error("Maximum number of topics reached")]
    MaxTopicsReached,

    /// Maximum memberships per user reached.
    #[error("Maximum memberships per user reached")]
    MaxMembershipsReached,
}

/// Topic table configuration.
#[derive(Debug, Clone)]
pub struct TopicsConfig {
    /// Maximum number of live topics.
    pub max_topics: usize,
    /// Maximum topics a single user may be a member of.
    pub max_memberships_per_user: usize,
    /// Whether to drop a topic when its last member leaves.
    pub auto_delete_empty: bool,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            max_memberships_per_user: 256,
            auto_delete_empty: true,
        }
    }
}

/// Result of a topic broadcast.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    /// Members the event was delivered to.
    pub delivered: Vec<UserId>,
    /// Members with no live connection. The caller decides whether these
    /// need offline queuing; the topic table itself never queues.
    pub offline: Vec<UserId>,
}

/// Per-conversation subscriber sets with a reverse user index.
#[derive(Debug, Default)]
pub struct Topics {
    /// Topic -> member user ids.
    members: DashMap<TopicId, DashSet<UserId>>,
    /// User -> topics joined.
    memberships: DashMap<UserId, DashSet<TopicId>>,
    config: TopicsConfig,
}

impl Topics {
    /// Create a topic table with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic table with custom configuration.
    #[must_use]
    pub fn with_config(config: TopicsConfig) -> Self {
        Self {
            members: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Add a user to a topic. Idempotent.
    ///
    /// Returns `true` if the user was not already a member.
    ///
    /// # Errors
    ///
    /// Returns an error when a limit would be exceeded.
    pub fn join(&self, user_id: &str, topic_id: &str) -> Result<bool, TopicError> {
        let user_topics = self.memberships.entry(user_id.to_string()).or_default();
        if user_topics.contains(topic_id) {
            return Ok(false);
        }
        if user_topics.len() >= self.config.max_memberships_per_user {
            return Err(TopicError::MaxMembershipsReached);
        }
        if !self.members.contains_key(topic_id) && self.members.len() >= self.config.max_topics {
            return Err(TopicError::MaxTopicsReached);
        }

        let set = self.members.entry(topic_id.to_string()).or_default();
        let is_new = set.insert(user_id.to_string());
        user_topics.insert(topic_id.to_string());

        if is_new {
            debug!(topic = %topic_id, user = %user_id, members = set.len(), "Joined topic");
        }
        Ok(is_new)
    }

    /// Remove a user from a topic. Idempotent; leaving a topic the user
    /// never joined is a no-op.
    ///
    /// Returns `true` if the user was a member.
    pub fn leave(&self, user_id: &str, topic_id: &str) -> bool {
        if let Some(user_topics) = self.memberships.get(user_id) {
            user_topics.remove(topic_id);
        }

        let removed = if let Some(set) = self.members.get(topic_id) {
            let removed = set.remove(user_id).is_some();
            let empty = set.is_empty();
            drop(set);
            if removed && empty && self.config.auto_delete_empty {
                self.members
                    .remove_if(topic_id, |_, members| members.is_empty());
                debug!(topic = %topic_id, "Deleted empty topic");
            }
            removed
        } else {
            false
        };

        if removed {
            debug!(topic = %topic_id, user = %user_id, "Left topic");
        }
        removed
    }

    /// Remove a user from every topic they are a member of.
    ///
    /// Returns the topics left. Called when a user is re-admitted, so stale
    /// membership from the previous session never outlives one offline
    /// period.
    pub fn leave_all(&self, user_id: &str) -> Vec<TopicId> {
        let Some((_, topics)) = self.memberships.remove(user_id) else {
            return Vec::new();
        };

        let left: Vec<TopicId> = topics.iter().map(|t| t.clone()).collect();
        for topic_id in &left {
            if let Some(set) = self.members.get(topic_id.as_str()) {
                set.remove(user_id);
                let empty = set.is_empty();
                drop(set);
                if empty && self.config.auto_delete_empty {
                    self.members
                        .remove_if(topic_id.as_str(), |_, members| members.is_empty());
                }
            }
        }

        if !left.is_empty() {
            debug!(user = %user_id, topics = left.len(), "Left all topics");
        }
        left
    }

    /// Check whether a user is a member of a topic.
    #[must_use]
    pub fn is_member(&self, user_id: &str, topic_id: &str) -> bool {
        self.members
            .get(topic_id)
            .is_some_and(|set| set.contains(user_id))
    }

    /// Member user ids of a topic.
    #[must_use]
    pub fn members(&self, topic_id: &str) -> Vec<UserId> {
        self.members
            .get(topic_id)
            .map(|set| set.iter().map(|u| u.clone()).collect())
            .unwrap_or_default()
    }

    /// Topics a user is a member of.
    #[must_use]
    pub fn topics_of(&self, user_id: &str) -> Vec<TopicId> {
        self.memberships
            .get(user_id)
            .map(|set| set.iter().map(|t| t.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliver an event to every member of a topic with a live connection,
    /// except the optional excluded sender.
    ///
    /// Members without a live connection are skipped here and reported in
    /// the outcome; queuing for them is the caller's responsibility.
    pub fn broadcast(
        &self,
        registry: &Registry,
        topic_id: &str,
        event: &Event,
        exclude: Option<&str>,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        let Some(set) = self.members.get(topic_id) else {
            trace!(topic = %topic_id, "Broadcast to non-existent topic");
            return outcome;
        };

        for member in set.iter() {
            if exclude == Some(member.as_str()) {
                continue;
            }
            if registry.send_to(&member, event.clone()) {
                outcome.delivered.push(member.clone());
            } else {
                outcome.offline.push(member.clone());
            }
        }

        trace!(
            topic = %topic_id,
            event = event.kind(),
            delivered = outcome.delivered.len(),
            offline = outcome.offline.len(),
            "Broadcast"
        );
        outcome
    }

    /// Topic table statistics.
    #[must_use]
    pub fn stats(&self) -> TopicStats {
        TopicStats {
            topic_count: self.members.len(),
            membership_count: self.members.iter().map(|set| set.len()).sum(),
        }
    }
}

/// Topic table statistics.
#[derive(Debug, Clone)]
pub struct TopicStats {
    /// Number of live topics.
    pub topic_count: usize,
    /// Total memberships across all topics.
    pub membership_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, ConnectionId};
    use tokio::sync::mpsc;

    fn online(registry: &Registry, user: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .admit(
                Some("tok"),
                user,
                ConnectionHandle::new(ConnectionId::generate(), tx),
            )
            .unwrap();
        rx
    }

    #[test]
    fn test_join_leave_idempotent() {
        let topics = Topics::new();

        assert!(topics.join("alice", "conv_1").unwrap());
        assert!(!topics.join("alice", "conv_1").unwrap());
        assert!(topics.is_member("alice", "conv_1"));

        assert!(topics.leave("alice", "conv_1"));
        assert!(!topics.leave("alice", "conv_1"));
        // Leaving a topic never joined is a no-op
        assert!(!topics.leave("alice", "conv_unknown"));
    }

    #[test]
    fn test_empty_topic_deleted() {
        let topics = Topics::new();
        topics.join("alice", "conv_1").unwrap();
        topics.leave("alice", "conv_1");

        assert_eq!(topics.stats().topic_count, 0);
    }

    #[test]
    fn test_leave_all() {
        let topics = Topics::new();
        topics.join("alice", "conv_1").unwrap();
        topics.join("alice", "conv_2").unwrap();
        topics.join("bob", "conv_1").unwrap();

        let mut left = topics.leave_all("alice");
        left.sort();
        assert_eq!(left, vec!["conv_1".to_string(), "conv_2".to_string()]);
        assert!(topics.topics_of("alice").is_empty());
        // Other members untouched
        assert!(topics.is_member("bob", "conv_1"));
    }

    #[test]
    fn test_membership_limit() {
        let topics = Topics::with_config(TopicsConfig {
            max_memberships_per_user: 1,
            ..TopicsConfig::default()
        });

        topics.join("alice", "conv_1").unwrap();
        assert!(matches!(
            topics.join("alice", "conv_2"),
            Err(TopicError::MaxMembershipsReached)
        ));
    }

    #[test]
    fn test_broadcast_scoping() {
        let registry = Registry::new();
        let topics = Topics::new();

        let mut alice_rx = online(&registry, "alice");
        let mut bob_rx = online(&registry, "bob");
        let mut dave_rx = online(&registry, "dave");

        topics.join("alice", "conv_1").unwrap();
        topics.join("bob", "conv_1").unwrap();
        topics.join("carol", "conv_1").unwrap(); // offline member
        topics.join("dave", "conv_other").unwrap();

        let outcome = topics.broadcast(&registry, "conv_1", &Event::pong(None), Some("alice"));

        // Delivered to online members except the excluded sender
        assert_eq!(outcome.delivered, vec!["bob".to_string()]);
        assert_eq!(outcome.offline, vec!["carol".to_string()]);

        assert!(bob_rx.try_recv().is_ok());
        assert!(alice_rx.try_recv().is_err());
        // Nobody outside the topic's membership set receives it
        assert!(dave_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_missing_topic() {
        let registry = Registry::new();
        let topics = Topics::new();

        let outcome = topics.broadcast(&registry, "conv_none", &Event::pong(None), None);
        assert!(outcome.delivered.is_empty());
        assert!(outcome.offline.is_empty());
    }
}
