//! Connection registry for Ripple.
//!
//! The registry is the single source of truth for which users are currently
//! connected and through which connection. Every other component resolves
//! users to live connections through it.

use dashmap::DashMap;
use ripple_protocol::types::now_millis;
use ripple_protocol::{Event, UserId};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ripple_protocol::types::unique_id("conn"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Admission was rejected: no identity could be established.
    #[error("No identity could be established for this connection")]
    Unauthenticated,
}

/// Handle to one live connection's outbound queue.
///
/// Events sent through the handle are delivered to the client in order.
/// A failed send means the peer task has gone away; callers treat that as
/// "not reachable", the same as an absent registry entry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Event>,
}

impl ConnectionHandle {
    /// Create a handle from a connection ID and its outbound sender.
    #[must_use]
    pub fn new(id: ConnectionId, sender: mpsc::UnboundedSender<Event>) -> Self {
        Self { id, sender }
    }

    /// The connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue an event for delivery.
    ///
    /// Returns `false` if the connection's outbound side is gone.
    pub fn send(&self, event: Event) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// A presence entry: exactly one per online user.
#[derive(Debug)]
struct PresenceEntry {
    handle: ConnectionHandle,
    connected_at: u64,
}

/// Outcome of a successful admission.
#[derive(Debug)]
pub struct Admission {
    /// The admitted identity.
    pub user_id: UserId,
    /// Handle of an earlier connection for the same user, evicted by this
    /// one. The caller should notify and close it.
    pub superseded: Option<ConnectionHandle>,
}

/// Outcome of removing a connection.
#[derive(Debug)]
pub struct Departure {
    /// The user the removed connection belonged to.
    pub user_id: UserId,
    /// Last-seen timestamp for the presence-offline fanout.
    pub last_seen: u64,
}

/// Maps logical user identities to their live connection handles.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<UserId, PresenceEntry>,
}

impl Registry {
    /// Create a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection for the claimed user.
    ///
    /// A later connect for the same user supersedes the earlier one: the
    /// returned [`Admission`] carries the evicted handle so the caller can
    /// notify and close it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unauthenticated`] when the token is absent
    /// or empty, or the claimed user id is empty. The caller must close the
    /// transport; admission is not retried.
    pub fn admit(
        &self,
        token: Option<&str>,
        user_id: &str,
        handle: ConnectionHandle,
    ) -> Result<Admission, RegistryError> {
        let token_ok = token.is_some_and(|t| !t.trim().is_empty());
        if !token_ok || user_id.trim().is_empty() {
            return Err(RegistryError::Unauthenticated);
        }

        let entry = PresenceEntry {
            handle,
            connected_at: now_millis(),
        };
        let superseded = self
            .entries
            .insert(user_id.to_string(), entry)
            .map(|old| old.handle);

        if superseded.is_some() {
            debug!(user = %user_id, "Admission superseded an existing connection");
        } else {
            debug!(user = %user_id, "User admitted");
        }

        Ok(Admission {
            user_id: user_id.to_string(),
            superseded,
        })
    }

    /// Remove the presence entry owned by `connection_id`.
    ///
    /// No-op (returns `None`) if no entry is owned by this connection —
    /// in particular when the entry was already superseded by a newer
    /// connection for the same user.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<Departure> {
        let user_id = self
            .entries
            .iter()
            .find(|entry| entry.handle.id() == connection_id)
            .map(|entry| entry.key().clone())?;

        // Guard against a newer connection having replaced the entry
        // between the scan and the removal.
        self.entries
            .remove_if(&user_id, |_, entry| entry.handle.id() == connection_id)
            .map(|_| {
                debug!(user = %user_id, connection = %connection_id, "User removed");
                Departure {
                    user_id,
                    last_seen: now_millis(),
                }
            })
    }

    /// Resolve a user to their live connection handle.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.entries.get(user_id).map(|e| e.handle.clone())
    }

    /// Check whether a user is currently online.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Snapshot of all online user ids. Not a live view.
    #[must_use]
    pub fn list_online(&self) -> Vec<UserId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.entries.len()
    }

    /// When the given user's current connection was admitted.
    #[must_use]
    pub fn connected_at(&self, user_id: &str) -> Option<u64> {
        self.entries.get(user_id).map(|e| e.connected_at)
    }

    /// Deliver an event to a user's live connection.
    ///
    /// Returns `false` if the user is offline or the send failed.
    pub fn send_to(&self, user_id: &str, event: Event) -> bool {
        match self.lookup(user_id) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(ConnectionId::generate(), tx), rx)
    }

    #[test]
    fn test_admit_requires_identity() {
        let registry = Registry::new();
        let (h, _rx) = handle();

        assert!(matches!(
            registry.admit(None, "alice", h.clone()),
            Err(RegistryError::Unauthenticated)
        ));
        assert!(matches!(
            registry.admit(Some("  "), "alice", h.clone()),
            Err(RegistryError::Unauthenticated)
        ));
        assert!(matches!(
            registry.admit(Some("tok"), "", h),
            Err(RegistryError::Unauthenticated)
        ));
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn test_admit_supersedes_not_duplicates() {
        let registry = Registry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        let first_id = h1.id().clone();

        let admission = registry.admit(Some("tok"), "alice", h1).unwrap();
        assert!(admission.superseded.is_none());

        let admission = registry.admit(Some("tok"), "alice", h2).unwrap();
        let evicted = admission.superseded.unwrap();
        assert_eq!(evicted.id(), &first_id);

        // At most one presence entry per user
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn test_remove_is_connection_scoped() {
        let registry = Registry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        let old_id = h1.id().clone();

        registry.admit(Some("tok"), "alice", h1).unwrap();
        registry.admit(Some("tok"), "alice", h2).unwrap();

        // The superseded connection's cleanup must not evict the new entry
        assert!(registry.remove(&old_id).is_none());
        assert!(registry.is_online("alice"));
    }

    #[test]
    fn test_remove_reports_departure() {
        let registry = Registry::new();
        let (h, _rx) = handle();
        let conn_id = h.id().clone();

        registry.admit(Some("tok"), "bob", h).unwrap();
        let departure = registry.remove(&conn_id).unwrap();
        assert_eq!(departure.user_id, "bob");
        assert!(departure.last_seen > 0);
        assert!(!registry.is_online("bob"));

        // Removing again is a no-op
        assert!(registry.remove(&conn_id).is_none());
    }

    #[test]
    fn test_send_to() {
        let registry = Registry::new();
        let (h, mut rx) = handle();

        registry.admit(Some("tok"), "carol", h).unwrap();

        assert!(registry.send_to("carol", Event::pong(None)));
        assert_eq!(rx.try_recv().unwrap(), Event::pong(None));

        assert!(!registry.send_to("nobody", Event::pong(None)));
    }

    #[test]
    fn test_list_online_snapshot() {
        let registry = Registry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();

        registry.admit(Some("tok"), "alice", h1).unwrap();
        registry.admit(Some("tok"), "bob", h2).unwrap();

        let mut online = registry.list_online();
        online.sort();
        assert_eq!(online, vec!["alice".to_string(), "bob".to_string()]);
    }
}
