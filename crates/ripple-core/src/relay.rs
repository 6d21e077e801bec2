//! Message relay for Ripple.
//!
//! The relay implements the chat event protocol on top of the connection
//! registry, the topic table, and the offline queue: admission and
//! presence fan-out, join/leave, message send with offline queuing, typing
//! indicators, and read receipts.
//!
//! Ordering: each connection's events are handled sequentially by its
//! socket task, and each recipient's outbound queue is an ordered channel,
//! so events from one sender reach every live member of a conversation in
//! the order the relay processed them.

use crate::offline::{enqueue_for, OfflineQueue, QueueError};
use crate::registry::{ConnectionHandle, ConnectionId, Registry, RegistryError};
use crate::topics::{TopicError, Topics};
use async_trait::async_trait;
use ripple_protocol::types::{now_millis, unique_id};
use ripple_protocol::{
    codes, ChatMessage, Event, MessageId, MessageType, PresenceStatus, UserId, PROTOCOL_VERSION,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Admission failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Topic membership failed.
    #[error(transparent)]
    Topic(#[from] TopicError),

    /// The offline queue failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The sender is not a member of the conversation.
    #[error("Not a member of conversation {0}")]
    NotAMember(String),

    /// The message archive rejected the write.
    #[error("Archive error: {0}")]
    Archive(String),
}

/// Archive failure reported by a [`MessageArchive`] implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ArchiveError(pub String);

/// Persistence seam for delivered messages (the relational store).
///
/// Failures are surfaced to the caller and not retried by the gateway.
#[async_trait]
pub trait MessageArchive: Send + Sync {
    /// Persist a stamped message.
    async fn save(&self, message: &ChatMessage) -> Result<(), ArchiveError>;
}

/// Archive that discards everything. Used when persistence is handled
/// elsewhere in the deployment.
#[derive(Debug, Default)]
pub struct NoopArchive;

#[async_trait]
impl MessageArchive for NoopArchive {
    async fn save(&self, _message: &ChatMessage) -> Result<(), ArchiveError> {
        Ok(())
    }
}

/// In-memory archive for tests.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    messages: std::sync::Mutex<Vec<ChatMessage>>,
}

impl MemoryArchive {
    /// Create an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything saved so far.
    #[must_use]
    pub fn saved(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl MessageArchive for MemoryArchive {
    async fn save(&self, message: &ChatMessage) -> Result<(), ArchiveError> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

/// The chat event relay.
pub struct Relay {
    registry: Arc<Registry>,
    topics: Arc<Topics>,
    offline: OfflineQueue,
    archive: Arc<dyn MessageArchive>,
    /// Heartbeat interval advertised in the `Connected` handshake.
    heartbeat_ms: u32,
}

impl Relay {
    /// Create a relay over the given state objects.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        topics: Arc<Topics>,
        offline: OfflineQueue,
        archive: Arc<dyn MessageArchive>,
        heartbeat_ms: u32,
    ) -> Self {
        Self {
            registry,
            topics,
            offline,
            archive,
            heartbeat_ms,
        }
    }

    /// The connection registry backing this relay.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The topic table backing this relay.
    #[must_use]
    pub fn topics(&self) -> &Arc<Topics> {
        &self.topics
    }

    /// The offline queue backing this relay.
    #[must_use]
    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    /// Admit a connection and run the connect sequence: presence fan-out,
    /// `Connected` handshake, and offline backlog delivery.
    ///
    /// An earlier connection for the same user is notified and dropped.
    /// Stale topic membership from the previous session is reset here —
    /// clients re-issue `join` after connecting.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unauthenticated`] (wrapped) when no
    /// identity can be established; the caller closes the transport.
    pub async fn connect(
        &self,
        token: Option<&str>,
        user_id: &str,
        handle: ConnectionHandle,
    ) -> Result<(), RelayError> {
        let admission = self.registry.admit(token, user_id, handle.clone())?;

        if let Some(old) = admission.superseded {
            old.send(Event::error(
                codes::SUPERSEDED,
                "Connection superseded by a newer session",
            ));
        }

        // Membership survives a disconnect so chat fan-out can queue for
        // the offline member; it is reset once the user is back.
        self.topics.leave_all(user_id);

        self.fan_out_presence(user_id, PresenceStatus::Online, None);

        handle.send(Event::Connected {
            user_id: user_id.to_string(),
            version: PROTOCOL_VERSION,
            heartbeat: self.heartbeat_ms,
        });

        self.deliver_backlog(user_id, &handle).await?;

        info!(user = %user_id, connection = %handle.id(), "User connected");
        Ok(())
    }

    /// Flush the user's offline backlog to the given connection.
    ///
    /// The queue is cleared only after the backlog was handed to the
    /// connection's outbound queue; if the user disconnected mid-drain the
    /// messages remain for the next attempt.
    async fn deliver_backlog(
        &self,
        user_id: &str,
        handle: &ConnectionHandle,
    ) -> Result<(), RelayError> {
        let backlog = self.offline.drain(user_id).await?;
        if backlog.is_empty() {
            return Ok(());
        }

        let count = backlog.len();
        if handle.send(Event::OfflineMessages { messages: backlog }) {
            self.offline.clear(user_id).await?;
            debug!(user = %user_id, count, "Delivered offline backlog");
        } else {
            warn!(user = %user_id, count, "Backlog delivery failed; queue left intact");
        }
        Ok(())
    }

    /// Tear down a connection: remove its presence entry and fan out the
    /// offline transition.
    ///
    /// Topic membership is deliberately retained (see `connect`). No-op if
    /// the connection owns no presence entry, e.g. when it was superseded.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        if let Some(departure) = self.registry.remove(connection_id) {
            self.fan_out_presence(
                &departure.user_id,
                PresenceStatus::Offline,
                Some(departure.last_seen),
            );
            info!(user = %departure.user_id, connection = %connection_id, "User disconnected");
        }
    }

    /// Presence fan-out to every online user except the subject.
    ///
    /// Broadcast-to-all is the simplest conformant policy; a friends-only
    /// filter belongs to the caller that knows the social graph.
    fn fan_out_presence(&self, user_id: &str, status: PresenceStatus, last_seen: Option<u64>) {
        let event = Event::presence(user_id, status, last_seen);
        for other in self.registry.list_online() {
            if other != user_id {
                self.registry.send_to(&other, event.clone());
            }
        }
        debug!(user = %user_id, status = status.as_str(), "Presence fan-out");
    }

    /// Join a conversation topic and notify the other members.
    ///
    /// # Errors
    ///
    /// Returns an error when a membership limit is exceeded.
    pub fn join(&self, user_id: &str, conversation_id: &str) -> Result<(), RelayError> {
        let is_new = self.topics.join(user_id, conversation_id)?;
        if is_new {
            self.topics.broadcast(
                &self.registry,
                conversation_id,
                &Event::UserJoined {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                },
                Some(user_id),
            );
        }
        Ok(())
    }

    /// Leave a conversation topic and notify the other members.
    pub fn leave(&self, user_id: &str, conversation_id: &str) {
        if self.topics.leave(user_id, conversation_id) {
            self.topics.broadcast(
                &self.registry,
                conversation_id,
                &Event::UserLeft {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                },
                Some(user_id),
            );
        }
    }

    /// Relay a chat message: stamp, archive, broadcast, and queue for
    /// offline members.
    ///
    /// # Errors
    ///
    /// Fails with [`RelayError::NotAMember`] when the sender has not
    /// joined the conversation, with [`RelayError::Archive`] when the
    /// persistence write fails (nothing is broadcast or queued in that
    /// case), and with [`RelayError::Queue`] when offline queuing fails
    /// for a recipient.
    pub async fn send_message(
        &self,
        sender_id: &str,
        conversation_id: &str,
        message_type: MessageType,
        content: String,
        media_refs: Vec<String>,
        reply_to_id: Option<MessageId>,
    ) -> Result<ChatMessage, RelayError> {
        if !self.topics.is_member(sender_id, conversation_id) {
            return Err(RelayError::NotAMember(conversation_id.to_string()));
        }

        let message = ChatMessage {
            id: unique_id("msg"),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            message_type,
            content,
            media_refs,
            reply_to_id,
            created_at: now_millis(),
            sender_summary: None,
        };

        // Persist before fan-out so a failed message is never reported as
        // delivered.
        self.archive
            .save(&message)
            .await
            .map_err(|e| RelayError::Archive(e.to_string()))?;

        let outcome = self.topics.broadcast(
            &self.registry,
            conversation_id,
            &Event::MessageNew {
                message: message.clone(),
            },
            Some(sender_id),
        );

        let offline: Vec<UserId> = outcome
            .offline
            .into_iter()
            .filter(|u| u != sender_id)
            .collect();
        let failures = enqueue_for(&self.offline, &offline, &message).await;
        if let Some((_, error)) = failures.into_iter().next() {
            return Err(RelayError::Queue(error));
        }

        debug!(
            conversation = %conversation_id,
            sender = %sender_id,
            delivered = outcome.delivered.len(),
            queued = offline.len(),
            "Message relayed"
        );
        Ok(message)
    }

    /// Broadcast a typing indicator to the conversation, excluding the
    /// sender. Ephemeral: never queued for offline members.
    ///
    /// # Errors
    ///
    /// Fails when the sender is not a member of the conversation.
    pub fn typing(
        &self,
        sender_id: &str,
        conversation_id: &str,
        typing: bool,
    ) -> Result<(), RelayError> {
        if !self.topics.is_member(sender_id, conversation_id) {
            return Err(RelayError::NotAMember(conversation_id.to_string()));
        }
        self.topics.broadcast(
            &self.registry,
            conversation_id,
            &Event::Typing {
                conversation_id: conversation_id.to_string(),
                user_id: sender_id.to_string(),
                typing,
            },
            Some(sender_id),
        );
        Ok(())
    }

    /// Fan a read receipt out to the conversation, excluding the reader.
    /// Durable read-state persistence is the archive's concern; the
    /// receipt itself is ephemeral and never queued.
    ///
    /// # Errors
    ///
    /// Fails when the reader is not a member of the conversation.
    pub fn mark_as_read(
        &self,
        reader_id: &str,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), RelayError> {
        if !self.topics.is_member(reader_id, conversation_id) {
            return Err(RelayError::NotAMember(conversation_id.to_string()));
        }
        self.topics.broadcast(
            &self.registry,
            conversation_id,
            &Event::MessageRead {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                reader_id: reader_id.to_string(),
            },
            Some(reader_id),
        );
        Ok(())
    }
}
