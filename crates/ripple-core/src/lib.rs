//! # ripple-core
//!
//! Stateful core of the Ripple realtime gateway.
//!
//! This crate provides the shared state objects behind the gateway edge:
//!
//! - **Registry** - Which users are online, and through which connection
//! - **Topics** - Per-conversation subscriber sets for broadcast scoping
//! - **Relay** - The chat event protocol over registry + topics + queue
//! - **OfflineQueue** - Durable per-user backlog for unreachable recipients
//! - **CallRegistry** - Offer/answer/ICE brokering between two users
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│   Topics    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │         │
//!                        ▼         ▼
//!                 ┌──────────┐  ┌──────────────┐
//!                 │ Registry │  │ OfflineQueue │
//!                 └──────────┘  └──────────────┘
//!                        ▲
//!                        │
//!                 ┌──────────────┐
//!                 │ CallRegistry │
//!                 └──────────────┘
//! ```
//!
//! All of these are explicitly-owned state objects injected into the
//! handlers that use them; tests construct isolated instances per case.
//! The gateway assumes a single process owns the registries — sharding
//! users across instances would need an external coordination layer.

pub mod calls;
pub mod offline;
pub mod registry;
pub mod relay;
pub mod topics;

pub use calls::{CallError, CallReceipt, CallRegistry};
pub use offline::{MemoryStore, OfflineQueue, OfflineStore, QueueError, QueueStats};
pub use registry::{
    Admission, ConnectionHandle, ConnectionId, Departure, Registry, RegistryError,
};
pub use relay::{MemoryArchive, MessageArchive, NoopArchive, Relay, RelayError};
pub use topics::{BroadcastOutcome, TopicError, Topics, TopicsConfig};
