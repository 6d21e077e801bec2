//! # ripple-protocol
//!
//! Wire protocol definitions for the Ripple realtime gateway.
//!
//! This crate defines the typed event vocabulary exchanged between clients
//! and the gateway, the shared domain types, and the MessagePack codec with
//! length-prefixed framing.
//!
//! ## Events
//!
//! - `Connect` / `Connected` - Admission handshake
//! - `Join` / `Leave` - Conversation topic membership
//! - `SendMessage` / `MessageNew` - Chat relay
//! - `TypingStart` / `TypingStop` / `MarkAsRead` - Ephemeral conversation events
//! - `PresenceChanged` / `OfflineMessages` - Presence and reconnect backlog
//! - `CallOffer` / `CallAnswer` / `CallDeclined` / `CallEnded` /
//!   `IceCandidate` / `CallStatus` - Call signaling
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{codec, Event};
//!
//! let event = Event::text_message("conv:lobby", "Hello, world!");
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod types;

pub use codec::{decode, encode, ProtocolError};
pub use events::{codes, Event};
pub use types::{
    CallId, CallPhase, CallSession, ChatMessage, ConversationId, MediaKind, MessageId,
    MessageType, PresenceStatus, SenderSummary, UserId,
};

/// Current protocol version, reported to the client in the `Connected`
/// handshake.
pub const PROTOCOL_VERSION: u8 = 1;
