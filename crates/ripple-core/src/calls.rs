//! Call signaling for Ripple.
//!
//! A per-call state machine brokering offer/answer/ICE exchange between
//! exactly two users. Sessions live in memory for the duration of the
//! call; a user appears as caller or callee in at most one non-terminal
//! session at a time, enforced through a user -> call side index.
//!
//! The table mutex guards state transitions only. Outbound deliveries
//! happen after the lock is released, so a slow client never blocks the
//! state machine.

use crate::registry::Registry;
use crate::topics::Topics;
use ripple_protocol::types::{now_millis, unique_id};
use ripple_protocol::{CallId, CallPhase, CallSession, Event, MediaKind, UserId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Call signaling errors.
#[derive(Debug, Error)]
pub enum CallError {
    /// One of the parties already has an active call.
    #[error("User {0} is busy in another call")]
    Busy(UserId),

    /// No session with this call id.
    #[error("Unknown call: {0}")]
    UnknownCall(CallId),

    /// The acting user is neither caller nor callee.
    #[error("User {0} is not a participant in call {1}")]
    NotParticipant(UserId, CallId),

    /// Only the recorded callee may answer or decline.
    #[error("Only the callee may answer or decline call {0}")]
    NotCallee(CallId),

    /// The call is not in a phase that allows this transition.
    #[error("Call {0} is in phase {1:?}, transition not allowed")]
    InvalidPhase(CallId, CallPhase),

    /// The callee has no live connection; the call was failed and cleaned
    /// up.
    #[error("Recipient unreachable")]
    Unreachable,
}

/// Result of ending a call.
#[derive(Debug, Clone, Serialize)]
pub struct CallReceipt {
    /// The ended call.
    pub call_id: CallId,
    /// Terminal phase the call ended in.
    pub phase: CallPhase,
    /// Total call duration in milliseconds.
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct CallTable {
    /// Active (non-terminal) sessions by call id.
    calls: HashMap<CallId, CallSession>,
    /// Side index enforcing single-active-call-per-user.
    by_user: HashMap<UserId, CallId>,
}

impl CallTable {
    fn release_parties(&mut self, session: &CallSession) {
        for party in [&session.caller_id, &session.callee_id] {
            if self.by_user.get(party) == Some(&session.call_id) {
                self.by_user.remove(party);
            }
        }
    }
}

/// Owns every live call session and brokers signaling between the parties.
pub struct CallRegistry {
    registry: Arc<Registry>,
    topics: Arc<Topics>,
    inner: Mutex<CallTable>,
}

impl CallRegistry {
    /// Create a call registry over the given connection registry and topic
    /// table.
    #[must_use]
    pub fn new(registry: Arc<Registry>, topics: Arc<Topics>) -> Self {
        Self {
            registry,
            topics,
            inner: Mutex::new(CallTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, CallTable> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of active sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.table().calls.len()
    }

    /// Start a call and deliver the offer to the callee.
    ///
    /// # Errors
    ///
    /// Fails with [`CallError::Busy`] when either party already has a
    /// non-terminal session, and with [`CallError::Unreachable`] when the
    /// callee has no live connection — in that case the session is
    /// transitioned to `Failed` and cleaned up before returning.
    pub fn initiate(
        &self,
        caller_id: &str,
        callee_id: &str,
        conversation_id: &str,
        media_kind: MediaKind,
        offer_sdp: String,
    ) -> Result<CallSession, CallError> {
        let session = {
            let mut table = self.table();

            if caller_id == callee_id || table.by_user.contains_key(caller_id) {
                return Err(CallError::Busy(caller_id.to_string()));
            }
            if table.by_user.contains_key(callee_id) {
                return Err(CallError::Busy(callee_id.to_string()));
            }

            let session = CallSession {
                call_id: unique_id("call"),
                caller_id: caller_id.to_string(),
                callee_id: callee_id.to_string(),
                conversation_id: conversation_id.to_string(),
                media_kind,
                phase: CallPhase::Calling,
                started_at: now_millis(),
                ended_at: None,
            };
            table
                .by_user
                .insert(caller_id.to_string(), session.call_id.clone());
            table
                .by_user
                .insert(callee_id.to_string(), session.call_id.clone());
            table
                .calls
                .insert(session.call_id.clone(), session.clone());
            session
        };

        let delivered = self.registry.send_to(
            callee_id,
            Event::CallOffer {
                call_id: session.call_id.clone(),
                caller_id: caller_id.to_string(),
                conversation_id: conversation_id.to_string(),
                media_kind,
                offer_sdp,
            },
        );

        if !delivered {
            // Clean up, unless the callee raced us and already answered
            // through the control plane.
            let mut table = self.table();
            let still_calling = table
                .calls
                .get(&session.call_id)
                .is_some_and(|s| s.phase == CallPhase::Calling);
            if still_calling {
                if let Some(failed) = table.calls.remove(&session.call_id) {
                    table.release_parties(&failed);
                }
                warn!(call = %session.call_id, callee = %callee_id, "Call failed: recipient unreachable");
                return Err(CallError::Unreachable);
            }
        }

        info!(
            call = %session.call_id,
            caller = %caller_id,
            callee = %callee_id,
            media = ?media_kind,
            "Call initiated"
        );
        Ok(session)
    }

    /// Accept a call and relay the SDP answer to the caller.
    ///
    /// # Errors
    ///
    /// Fails when the call is unknown, the acting user is not the
    /// recorded callee, or the call has already left the pre-answer phase.
    pub fn answer(
        &self,
        callee_id: &str,
        call_id: &str,
        answer_sdp: String,
    ) -> Result<CallSession, CallError> {
        let session = {
            let mut table = self.table();
            let session = table
                .calls
                .get_mut(call_id)
                .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;

            if session.callee_id != callee_id {
                return Err(CallError::NotCallee(call_id.to_string()));
            }
            if session.phase != CallPhase::Calling {
                return Err(CallError::InvalidPhase(call_id.to_string(), session.phase));
            }

            session.phase = CallPhase::Accepted;
            session.clone()
        };

        self.registry.send_to(
            &session.caller_id,
            Event::CallAnswer {
                call_id: session.call_id.clone(),
                answer_sdp,
            },
        );
        self.fan_out_status(&session);

        info!(call = %call_id, callee = %callee_id, "Call accepted");
        Ok(session)
    }

    /// Decline a call and notify the caller. Terminal; the session is
    /// deleted and both parties are immediately free to call again.
    ///
    /// # Errors
    ///
    /// Same participant and phase checks as [`answer`](Self::answer).
    pub fn decline(&self, callee_id: &str, call_id: &str) -> Result<CallSession, CallError> {
        let session = {
            let mut table = self.table();
            {
                let session = table
                    .calls
                    .get(call_id)
                    .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
                if session.callee_id != callee_id {
                    return Err(CallError::NotCallee(call_id.to_string()));
                }
                if session.phase != CallPhase::Calling {
                    return Err(CallError::InvalidPhase(call_id.to_string(), session.phase));
                }
            }
            let mut session = table
                .calls
                .remove(call_id)
                .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
            session.phase = CallPhase::Declined;
            session.ended_at = Some(now_millis());
            table.release_parties(&session);
            session
        };

        self.registry.send_to(
            &session.caller_id,
            Event::CallDeclined {
                call_id: session.call_id.clone(),
            },
        );

        info!(call = %call_id, callee = %callee_id, "Call declined");
        Ok(session)
    }

    /// End a call. Callable by either participant, or by the system with
    /// `ended_by = None` (e.g. the ring-timeout sweep).
    ///
    /// Both live parties receive `CallEnded` with the computed duration;
    /// if the call had been accepted, a status update also fans out to the
    /// conversation topic.
    ///
    /// # Errors
    ///
    /// Fails only when no session exists for `call_id`.
    pub fn end(
        &self,
        call_id: &str,
        ended_by: Option<&str>,
        reason: Option<String>,
    ) -> Result<CallReceipt, CallError> {
        self.terminate(call_id, CallPhase::Ended, ended_by, reason)
    }

    fn terminate(
        &self,
        call_id: &str,
        phase: CallPhase,
        ended_by: Option<&str>,
        reason: Option<String>,
    ) -> Result<CallReceipt, CallError> {
        let (session, was_accepted) = {
            let mut table = self.table();
            let mut session = table
                .calls
                .remove(call_id)
                .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
            let was_accepted = session.phase == CallPhase::Accepted;
            session.phase = phase;
            session.ended_at = Some(now_millis());
            table.release_parties(&session);
            (session, was_accepted)
        };

        let receipt = CallReceipt {
            call_id: session.call_id.clone(),
            phase: session.phase,
            duration_ms: session.duration_ms(),
        };

        let ended = Event::CallEnded {
            call_id: session.call_id.clone(),
            reason: reason.clone(),
            duration_ms: receipt.duration_ms,
        };
        for party in [&session.caller_id, &session.callee_id] {
            self.registry.send_to(party, ended.clone());
        }
        if was_accepted {
            self.fan_out_status(&session);
        }

        info!(
            call = %call_id,
            phase = ?session.phase,
            ended_by = ended_by.unwrap_or("system"),
            duration_ms = receipt.duration_ms,
            "Call ended"
        );
        Ok(receipt)
    }

    /// Forward an ICE candidate to the other participant.
    ///
    /// Silently dropped when that participant is offline; candidates are
    /// never queued.
    ///
    /// # Errors
    ///
    /// Fails when the call is unknown or `from_user_id` is not a
    /// participant.
    pub fn relay_ice_candidate(
        &self,
        call_id: &str,
        from_user_id: &str,
        candidate: serde_json::Value,
    ) -> Result<(), CallError> {
        let peer = {
            let table = self.table();
            let session = table
                .calls
                .get(call_id)
                .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
            session
                .peer_of(from_user_id)
                .cloned()
                .ok_or_else(|| {
                    CallError::NotParticipant(from_user_id.to_string(), call_id.to_string())
                })?
        };

        self.registry.send_to(
            &peer,
            Event::IceCandidate {
                call_id: call_id.to_string(),
                candidate,
            },
        );
        Ok(())
    }

    /// Snapshot of a call's session, participant-gated.
    ///
    /// # Errors
    ///
    /// Fails when the call is unknown or the requesting user is not a
    /// participant.
    pub fn status(&self, call_id: &str, requesting_user: &str) -> Result<CallSession, CallError> {
        let table = self.table();
        let session = table
            .calls
            .get(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
        if !session.is_participant(requesting_user) {
            return Err(CallError::NotParticipant(
                requesting_user.to_string(),
                call_id.to_string(),
            ));
        }
        Ok(session.clone())
    }

    /// The user's active session, if any.
    ///
    /// A stale side-index entry pointing at a call no longer present is
    /// cleared here and reported as not-in-call.
    pub fn status_for_user(&self, user_id: &str) -> Option<CallSession> {
        let mut table = self.table();
        let call_id = table.by_user.get(user_id)?.clone();
        match table.calls.get(&call_id) {
            Some(session) => Some(session.clone()),
            None => {
                warn!(user = %user_id, call = %call_id, "Cleared stale call index entry");
                table.by_user.remove(user_id);
                None
            }
        }
    }

    /// Fail every call that has been ringing longer than `max_ring`.
    ///
    /// Returns a receipt per expired call. Both parties are notified with
    /// `CallEnded { reason: "ring timeout" }`.
    pub fn expire_unanswered(&self, max_ring: Duration) -> Vec<CallReceipt> {
        let deadline = now_millis().saturating_sub(max_ring.as_millis() as u64);
        let expired: Vec<CallId> = {
            let table = self.table();
            table
                .calls
                .values()
                .filter(|s| s.phase == CallPhase::Calling && s.started_at <= deadline)
                .map(|s| s.call_id.clone())
                .collect()
        };

        let mut receipts = Vec::with_capacity(expired.len());
        for call_id in expired {
            debug!(call = %call_id, "Ring timeout");
            // The call may have transitioned since the scan; skip it then
            if let Ok(receipt) = self.terminate(
                &call_id,
                CallPhase::Failed,
                None,
                Some("ring timeout".to_string()),
            ) {
                receipts.push(receipt);
            }
        }
        receipts
    }

    fn fan_out_status(&self, session: &CallSession) {
        self.topics.broadcast(
            &self.registry,
            &session.conversation_id,
            &Event::CallStatus {
                call_id: session.call_id.clone(),
                conversation_id: session.conversation_id.clone(),
                phase: session.phase,
            },
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, ConnectionId};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<Registry>,
        topics: Arc<Topics>,
        calls: CallRegistry,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let topics = Arc::new(Topics::new());
        let calls = CallRegistry::new(registry.clone(), topics.clone());
        Fixture {
            registry,
            topics,
            calls,
        }
    }

    fn online(f: &Fixture, user: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        f.registry
            .admit(
                Some("tok"),
                user,
                ConnectionHandle::new(ConnectionId::generate(), tx),
            )
            .unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_offer_answer_end_happy_path() {
        let f = fixture();
        let mut alice_rx = online(&f, "alice");
        let mut bob_rx = online(&f, "bob");

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Video, "offer-sdp".into())
            .unwrap();
        assert_eq!(session.phase, CallPhase::Calling);

        // Bob receives the offer with the same call id returned to Alice
        let events = drain(&mut bob_rx);
        let offered_id = events
            .iter()
            .find_map(|e| match e {
                Event::CallOffer { call_id, caller_id, offer_sdp, .. } => {
                    assert_eq!(caller_id, "alice");
                    assert_eq!(offer_sdp, "offer-sdp");
                    Some(call_id.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(offered_id, session.call_id);

        // Bob answers; Alice receives the answer
        let answered = f.calls.answer("bob", &session.call_id, "answer-sdp".into()).unwrap();
        assert_eq!(answered.phase, CallPhase::Accepted);
        let events = drain(&mut alice_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::CallAnswer { answer_sdp, .. } if answer_sdp == "answer-sdp"
        )));

        // Both report in-call
        assert_eq!(
            f.calls.status_for_user("alice").unwrap().call_id,
            session.call_id
        );
        assert_eq!(
            f.calls.status_for_user("bob").unwrap().call_id,
            session.call_id
        );

        // Alice ends; both receive CallEnded with duration >= 0
        let receipt = f.calls.end(&session.call_id, Some("alice"), None).unwrap();
        assert_eq!(receipt.phase, CallPhase::Ended);
        for rx in [&mut alice_rx, &mut bob_rx] {
            let events = drain(rx);
            assert!(events
                .iter()
                .any(|e| matches!(e, Event::CallEnded { .. })));
        }

        assert!(f.calls.status_for_user("alice").is_none());
        assert!(f.calls.status_for_user("bob").is_none());
        assert_eq!(f.calls.active_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_invariant() {
        let f = fixture();
        let _alice_rx = online(&f, "alice");
        let _bob_rx = online(&f, "bob");
        let _carol_rx = online(&f, "carol");

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Audio, "sdp".into())
            .unwrap();

        // Caller busy
        assert!(matches!(
            f.calls.initiate("alice", "carol", "conv_2", MediaKind::Audio, "sdp".into()),
            Err(CallError::Busy(u)) if u == "alice"
        ));
        // Callee busy
        assert!(matches!(
            f.calls.initiate("carol", "bob", "conv_2", MediaKind::Audio, "sdp".into()),
            Err(CallError::Busy(u)) if u == "bob"
        ));

        // After a terminal transition both parties are immediately free
        f.calls.decline("bob", &session.call_id).unwrap();
        f.calls
            .initiate("alice", "carol", "conv_2", MediaKind::Audio, "sdp".into())
            .unwrap();
    }

    #[tokio::test]
    async fn test_initiate_to_offline_callee_fails_and_cleans_up() {
        let f = fixture();
        let _alice_rx = online(&f, "alice");

        let result = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Audio, "sdp".into());
        assert!(matches!(result, Err(CallError::Unreachable)));

        // No session or index entry is left behind
        assert_eq!(f.calls.active_count(), 0);
        assert!(f.calls.status_for_user("alice").is_none());
        assert!(f.calls.status_for_user("bob").is_none());
    }

    #[tokio::test]
    async fn test_answer_decline_are_callee_gated() {
        let f = fixture();
        let _alice_rx = online(&f, "alice");
        let _bob_rx = online(&f, "bob");

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Audio, "sdp".into())
            .unwrap();

        assert!(matches!(
            f.calls.answer("alice", &session.call_id, "sdp".into()),
            Err(CallError::NotCallee(_))
        ));
        assert!(matches!(
            f.calls.decline("carol", &session.call_id),
            Err(CallError::NotCallee(_))
        ));
        assert!(matches!(
            f.calls.answer("bob", "call_nope", "sdp".into()),
            Err(CallError::UnknownCall(_))
        ));

        // End succeeds regardless of caller identity for an existing call
        f.calls.end(&session.call_id, Some("someone-else"), None).unwrap();
    }

    #[tokio::test]
    async fn test_answer_after_terminal_phase_fails() {
        let f = fixture();
        let _alice_rx = online(&f, "alice");
        let _bob_rx = online(&f, "bob");

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Audio, "sdp".into())
            .unwrap();
        f.calls.answer("bob", &session.call_id, "sdp".into()).unwrap();

        // A second answer is no longer in the pre-answer phase
        assert!(matches!(
            f.calls.answer("bob", &session.call_id, "sdp".into()),
            Err(CallError::InvalidPhase(_, CallPhase::Accepted))
        ));
    }

    #[tokio::test]
    async fn test_ice_relay() {
        let f = fixture();
        let mut alice_rx = online(&f, "alice");
        let mut bob_rx = online(&f, "bob");

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Video, "sdp".into())
            .unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let candidate = serde_json::json!({"candidate": "host 10.0.0.1", "sdpMid": "0"});
        f.calls
            .relay_ice_candidate(&session.call_id, "alice", candidate.clone())
            .unwrap();

        let events = drain(&mut bob_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::IceCandidate { candidate: c, .. } if *c == candidate
        )));
        // Candidates are relayed to the peer only
        assert!(drain(&mut alice_rx).is_empty());

        assert!(matches!(
            f.calls.relay_ice_candidate(&session.call_id, "carol", candidate),
            Err(CallError::NotParticipant(_, _))
        ));
    }

    #[tokio::test]
    async fn test_accepted_call_status_fans_out_to_topic() {
        let f = fixture();
        let _alice_rx = online(&f, "alice");
        let _bob_rx = online(&f, "bob");
        let mut carol_rx = online(&f, "carol");

        for user in ["alice", "bob", "carol"] {
            f.topics.join(user, "conv_1").unwrap();
        }

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Audio, "sdp".into())
            .unwrap();
        f.calls.answer("bob", &session.call_id, "sdp".into()).unwrap();

        let events = drain(&mut carol_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::CallStatus { phase: CallPhase::Accepted, .. }
        )));

        f.calls.end(&session.call_id, Some("bob"), None).unwrap();
        let events = drain(&mut carol_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::CallStatus { phase: CallPhase::Ended, .. }
        )));
    }

    #[tokio::test]
    async fn test_expire_unanswered() {
        let f = fixture();
        let mut alice_rx = online(&f, "alice");
        let _bob_rx = online(&f, "bob");

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Audio, "sdp".into())
            .unwrap();
        drain(&mut alice_rx);

        // Nothing has been ringing for an hour
        assert!(f.calls.expire_unanswered(Duration::from_secs(3600)).is_empty());

        let receipts = f.calls.expire_unanswered(Duration::ZERO);
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].call_id, session.call_id);
        assert_eq!(receipts[0].phase, CallPhase::Failed);

        let events = drain(&mut alice_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::CallEnded { reason: Some(r), .. } if r == "ring timeout"
        )));
        assert!(f.calls.status_for_user("alice").is_none());
    }

    #[tokio::test]
    async fn test_accepted_calls_do_not_expire() {
        let f = fixture();
        let _alice_rx = online(&f, "alice");
        let _bob_rx = online(&f, "bob");

        let session = f
            .calls
            .initiate("alice", "bob", "conv_1", MediaKind::Audio, "sdp".into())
            .unwrap();
        f.calls.answer("bob", &session.call_id, "sdp".into()).unwrap();

        assert!(f.calls.expire_unanswered(Duration::ZERO).is_empty());
        assert_eq!(f.calls.active_count(), 1);
    }
}
