//! Shared domain types for the Ripple gateway.
//!
//! These types appear both on the wire and in the durable offline queue,
//! so everything here derives `Serialize`/`Deserialize`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A logical user identity.
pub type UserId = String;

/// A conversation identifier; one conversation backs one broadcast topic.
pub type ConversationId = String;

/// A chat message identifier.
pub type MessageId = String;

/// A call session identifier.
pub type CallId = String;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Generate a unique, prefixed identifier (e.g. `msg_18f3a2...`).
#[must_use]
pub fn unique_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{:x}", prefix, timestamp.wrapping_add(counter))
}

/// The kind of content a chat message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
}

/// Denormalized sender info attached to queued messages so offline
/// recipients can render them without a profile lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSummary {
    /// Display name of the sender.
    pub display_name: String,
    /// Avatar URL, if the sender has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A chat message as relayed and as stored in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message identifier, stamped by the gateway.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Sender identity, stamped by the gateway.
    pub sender_id: UserId,
    /// Content kind.
    pub message_type: MessageType,
    /// Message body (text, or a caption for media).
    pub content: String,
    /// References into the object store for media attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_refs: Vec<String>,
    /// Message this one replies to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Server timestamp in milliseconds, stamped by the gateway.
    pub created_at: u64,
    /// Denormalized sender info.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_summary: Option<SenderSummary>,
}

/// Whether a user is currently reachable through a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    /// Status as a static string, for logging and metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Media negotiated by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// State-machine phase of a call session.
///
/// `Calling` covers the entire pre-answer window (the protocol does not
/// distinguish a separate ringing phase). `Declined`, `Ended` and `Failed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Calling,
    Accepted,
    Declined,
    Ended,
    Failed,
}

impl CallPhase {
    /// Whether the call can still transition.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallPhase::Declined | CallPhase::Ended | CallPhase::Failed
        )
    }
}

/// The signaling-layer record of one call attempt between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    /// Unique call identifier.
    pub call_id: CallId,
    /// The party that initiated the call.
    pub caller_id: UserId,
    /// The party being called.
    pub callee_id: UserId,
    /// Conversation the call is associated with.
    pub conversation_id: ConversationId,
    /// Negotiated media kind.
    pub media_kind: MediaKind,
    /// Current state-machine phase.
    pub phase: CallPhase,
    /// When the call was initiated, milliseconds since epoch.
    pub started_at: u64,
    /// When the call reached a terminal phase, if it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
}

impl CallSession {
    /// Whether the given user is one of the two participants.
    #[must_use]
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    /// The participant on the other side of the call from `user_id`.
    #[must_use]
    pub fn peer_of(&self, user_id: &str) -> Option<&UserId> {
        if self.caller_id == user_id {
            Some(&self.callee_id)
        } else if self.callee_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }

    /// Elapsed call duration in milliseconds.
    ///
    /// For a call that has not ended yet, this is the time since initiation.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(now_millis);
        end.saturating_sub(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids() {
        let a = unique_id("msg");
        let b = unique_id("msg");
        assert_ne!(a, b);
        assert!(a.starts_with("msg_"));
    }

    #[test]
    fn test_call_phase_terminal() {
        assert!(!CallPhase::Calling.is_terminal());
        assert!(!CallPhase::Accepted.is_terminal());
        assert!(CallPhase::Declined.is_terminal());
        assert!(CallPhase::Ended.is_terminal());
        assert!(CallPhase::Failed.is_terminal());
    }

    #[test]
    fn test_call_session_peer() {
        let session = CallSession {
            call_id: "call_1".into(),
            caller_id: "alice".into(),
            callee_id: "bob".into(),
            conversation_id: "conv_1".into(),
            media_kind: MediaKind::Audio,
            phase: CallPhase::Calling,
            started_at: now_millis(),
            ended_at: None,
        };

        assert!(session.is_participant("alice"));
        assert!(session.is_participant("bob"));
        assert!(!session.is_participant("carol"));
        assert_eq!(session.peer_of("alice").unwrap(), "bob");
        assert_eq!(session.peer_of("bob").unwrap(), "alice");
        assert!(session.peer_of("carol").is_none());
    }

    #[test]
    fn test_duration_uses_ended_at() {
        let session = CallSession {
            call_id: "call_2".into(),
            caller_id: "alice".into(),
            callee_id: "bob".into(),
            conversation_id: "conv_1".into(),
            media_kind: MediaKind::Video,
            phase: CallPhase::Ended,
            started_at: 1_000,
            ended_at: Some(4_500),
        };
        assert_eq!(session.duration_ms(), 3_500);
    }
}
