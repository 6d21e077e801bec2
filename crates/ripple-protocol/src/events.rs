//! Event types for the Ripple protocol.
//!
//! Every payload exchanged over a gateway connection is one variant of
//! [`Event`], tagged by a `type` field and validated at decode time.
//! Unknown or malformed payloads are dropped by the relay boundary, never
//! fatal to the connection.

use crate::types::{
    CallId, CallPhase, ChatMessage, ConversationId, MediaKind, MessageId, MessageType,
    PresenceStatus, UserId,
};
use serde::{Deserialize, Serialize};

/// A protocol event.
///
/// Client-to-gateway commands and gateway-to-client notifications share one
/// vocabulary; the direction of each variant is noted on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // ---- client -> gateway ----
    /// Initial handshake. Must be the first event on a connection.
    Connect {
        /// Authentication token; admission is rejected without one.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Identity the client claims.
        user_id: UserId,
    },

    /// Join a conversation's broadcast topic.
    Join { conversation_id: ConversationId },

    /// Leave a conversation's broadcast topic.
    Leave { conversation_id: ConversationId },

    /// Send a chat message into a conversation.
    SendMessage {
        conversation_id: ConversationId,
        message_type: MessageType,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        media_refs: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<MessageId>,
    },

    /// The sender started typing in a conversation.
    TypingStart { conversation_id: ConversationId },

    /// The sender stopped typing in a conversation.
    TypingStop { conversation_id: ConversationId },

    /// Mark a message as read; fans a read receipt out to the topic.
    MarkAsRead {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// Start a call to another user.
    CallInitiate {
        callee_id: UserId,
        conversation_id: ConversationId,
        media_kind: MediaKind,
        /// SDP offer, relayed opaquely.
        offer_sdp: String,
    },

    /// Hang up a call the sender participates in.
    CallHangup {
        call_id: CallId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Keepalive ping.
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    // ---- gateway -> client ----
    /// Admission succeeded.
    Connected {
        user_id: UserId,
        /// Protocol version the gateway speaks.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Another member joined the conversation topic.
    UserJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// Another member left the conversation topic.
    UserLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// A new chat message, stamped by the gateway.
    MessageNew { message: ChatMessage },

    /// Typing indicator for a conversation member.
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        typing: bool,
    },

    /// Read receipt fan-out.
    MessageRead {
        conversation_id: ConversationId,
        message_id: MessageId,
        reader_id: UserId,
    },

    /// A user's presence changed.
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<u64>,
    },

    /// Backlog delivered on reconnect, oldest first.
    OfflineMessages { messages: Vec<ChatMessage> },

    /// An incoming call offer.
    CallOffer {
        call_id: CallId,
        caller_id: UserId,
        conversation_id: ConversationId,
        media_kind: MediaKind,
        /// SDP offer, relayed opaquely.
        offer_sdp: String,
    },

    /// The callee accepted; SDP answer relayed to the caller.
    CallAnswer {
        call_id: CallId,
        /// SDP answer, relayed opaquely.
        answer_sdp: String,
    },

    /// The callee declined.
    CallDeclined { call_id: CallId },

    /// The call reached a terminal phase.
    CallEnded {
        call_id: CallId,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        duration_ms: u64,
    },

    /// ICE candidate relayed between call participants.
    IceCandidate {
        call_id: CallId,
        /// Candidate payload, relayed opaquely.
        candidate: serde_json::Value,
    },

    /// Call state fan-out to the conversation topic.
    CallStatus {
        call_id: CallId,
        conversation_id: ConversationId,
        phase: CallPhase,
    },

    /// Out-of-band notification pushed to a client.
    Notification {
        title: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },

    /// Error response.
    Error {
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Event {
    /// The event's wire tag, for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "connect",
            Event::Join { .. } => "join",
            Event::Leave { .. } => "leave",
            Event::SendMessage { .. } => "send_message",
            Event::TypingStart { .. } => "typing_start",
            Event::TypingStop { .. } => "typing_stop",
            Event::MarkAsRead { .. } => "mark_as_read",
            Event::CallInitiate { .. } => "call_initiate",
            Event::CallHangup { .. } => "call_hangup",
            Event::Ping { .. } => "ping",
            Event::Connected { .. } => "connected",
            Event::UserJoined { .. } => "user_joined",
            Event::UserLeft { .. } => "user_left",
            Event::MessageNew { .. } => "message_new",
            Event::Typing { .. } => "typing",
            Event::MessageRead { .. } => "message_read",
            Event::PresenceChanged { .. } => "presence_changed",
            Event::OfflineMessages { .. } => "offline_messages",
            Event::CallOffer { .. } => "call_offer",
            Event::CallAnswer { .. } => "call_answer",
            Event::CallDeclined { .. } => "call_declined",
            Event::CallEnded { .. } => "call_ended",
            Event::IceCandidate { .. } => "ice_candidate",
            Event::CallStatus { .. } => "call_status",
            Event::Notification { .. } => "notification",
            Event::Error { .. } => "error",
            Event::Pong { .. } => "pong",
        }
    }

    /// Create a new Connect event.
    #[must_use]
    pub fn connect(token: Option<String>, user_id: impl Into<UserId>) -> Self {
        Event::Connect {
            token,
            user_id: user_id.into(),
        }
    }

    /// Create a new Join event.
    #[must_use]
    pub fn join(conversation_id: impl Into<ConversationId>) -> Self {
        Event::Join {
            conversation_id: conversation_id.into(),
        }
    }

    /// Create a new Leave event.
    #[must_use]
    pub fn leave(conversation_id: impl Into<ConversationId>) -> Self {
        Event::Leave {
            conversation_id: conversation_id.into(),
        }
    }

    /// Create a text SendMessage event.
    #[must_use]
    pub fn text_message(
        conversation_id: impl Into<ConversationId>,
        content: impl Into<String>,
    ) -> Self {
        Event::SendMessage {
            conversation_id: conversation_id.into(),
            message_type: MessageType::Text,
            content: content.into(),
            media_refs: Vec::new(),
            reply_to_id: None,
        }
    }

    /// Create a presence-changed event.
    #[must_use]
    pub fn presence(
        user_id: impl Into<UserId>,
        status: PresenceStatus,
        last_seen: Option<u64>,
    ) -> Self {
        Event::PresenceChanged {
            user_id: user_id.into(),
            status,
            last_seen,
        }
    }

    /// Create a new Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Event::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong event.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Event::Pong { timestamp }
    }
}

/// Protocol error codes carried in [`Event::Error`].
pub mod codes {
    /// Admission rejected: no identity could be established.
    pub const UNAUTHENTICATED: u16 = 1001;
    /// Malformed or unexpected event.
    pub const BAD_EVENT: u16 = 1002;
    /// Operation precondition failed (busy, not a participant, ...).
    pub const PRECONDITION: u16 = 1003;
    /// The connection was superseded by a newer one for the same user.
    pub const SUPERSEDED: u16 = 1004;
    /// Storage-layer failure.
    pub const STORAGE: u16 = 1005;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        assert_eq!(Event::join("conv_1").kind(), "join");
        assert_eq!(Event::text_message("conv_1", "hi").kind(), "send_message");
        assert_eq!(Event::pong(None).kind(), "pong");
    }

    #[test]
    fn test_event_json_tagging() {
        let event = Event::text_message("conv_1", "hello");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "send_message");
        assert_eq!(json["conversation_id"], "conv_1");
        // Empty media_refs are omitted from the wire form
        assert!(json.get("media_refs").is_none());
    }

    #[test]
    fn test_unknown_event_is_decode_error() {
        let result: Result<Event, _> =
            serde_json::from_str(r#"{"type":"warp_drive","speed":9}"#);
        assert!(result.is_err());
    }
}
