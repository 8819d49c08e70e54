//! Server-side session registry and event fan-out.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::ResourceId;
use crate::SessionId;

/// Lifecycle states of a server-side session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Keep-alives are current; events flow.
    Open,
    /// The client connection is in doubt (leader change, reconnect window).
    Unstable,
    /// Keep-alives lapsed beyond the timeout. Terminal.
    Expired,
    /// Explicitly closed by the client. Terminal.
    Closed,
}

/// One server-initiated event, addressed to a session and scoped to the
/// resource that published it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session: SessionId,
    /// Monotonic per-session sequence number, starting at 1.
    pub seq: u64,
    pub resource: ResourceId,
    pub topic: String,
    pub payload: Vec<u8>,
}

struct ServerSession {
    id: SessionId,
    state: SessionState,
    next_seq: u64,
    /// Events published but not yet acknowledged, in sequence order.
    unacked: VecDeque<SessionEvent>,
    /// The live transport sink, absent while the client is disconnected.
    sink: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl ServerSession {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Open,
            next_seq: 1,
            unacked: VecDeque::new(),
            sink: None,
        }
    }

    fn publish(&mut self, resource: ResourceId, topic: &str, payload: Vec<u8>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let event = SessionEvent {
            session: self.id,
            seq,
            resource,
            topic: topic.to_string(),
            payload,
        };
        self.unacked.push_back(event.clone());
        if let Some(sink) = &self.sink {
            if sink.send(event).is_err() {
                // Receiver went away without a detach; treat as disconnected.
                self.sink = None;
                self.state = SessionState::Unstable;
            }
        }
        seq
    }

    fn ack(&mut self, resource: ResourceId, seq: u64) {
        // One session may back several resource handles, each with its own
        // dispatcher; an ack only covers the acker's own event stream, so
        // another handle's still-undelivered events survive for redelivery.
        self.unacked.retain(|event| event.resource != resource || event.seq > seq);
    }
}

/// The registry of all sessions known to one state-machine host.
///
/// Guarantees provided to the client: events are delivered in sequence order
/// at least once; unacknowledged events are replayed after a reconnect to the
/// same session; once a session expires its queue is dropped and redelivery
/// stops.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, ServerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session in `Open` state. Idempotent for a live id.
    pub fn register(&mut self, id: SessionId) {
        self.sessions.entry(id).or_insert_with(|| ServerSession::new(id));
    }

    pub fn state(&self, id: SessionId) -> SessionState {
        self.sessions.get(&id).map(|s| s.state).unwrap_or(SessionState::Closed)
    }

    pub fn is_open(&self, id: SessionId) -> bool {
        matches!(self.state(id), SessionState::Open | SessionState::Unstable)
    }

    /// Queue an event for `id`. Returns the assigned sequence number, or
    /// `None` when the session can no longer receive events.
    pub fn publish(&mut self, id: SessionId, resource: ResourceId, topic: &str, payload: Vec<u8>) -> Option<u64> {
        let session = self.sessions.get_mut(&id)?;
        match session.state {
            SessionState::Open | SessionState::Unstable => Some(session.publish(resource, topic, payload)),
            SessionState::Expired | SessionState::Closed => None,
        }
    }

    /// Acknowledge delivery of every event published by `resource` up to and
    /// including `seq`.
    pub fn ack(&mut self, id: SessionId, resource: ResourceId, seq: u64) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.ack(resource, seq);
        }
    }

    /// Attach a transport sink, replaying unacknowledged events in order
    /// before any new publish reaches it.
    pub fn attach(&mut self, id: SessionId, sink: mpsc::UnboundedSender<SessionEvent>) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if matches!(session.state, SessionState::Expired | SessionState::Closed) {
                return;
            }
            for event in &session.unacked {
                if sink.send(event.clone()).is_err() {
                    return;
                }
            }
            session.sink = Some(sink);
            session.state = SessionState::Open;
        }
    }

    /// Drop the transport sink; the session becomes `Unstable` and keeps
    /// queueing events for redelivery.
    pub fn detach(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.sink = None;
            if session.state == SessionState::Open {
                session.state = SessionState::Unstable;
            }
        }
    }

    /// Expire the session: enqueued events are dropped and redelivery stops.
    pub fn expire(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = SessionState::Expired;
            session.sink = None;
            session.unacked.clear();
        }
    }

    /// Close the session on explicit client request.
    pub fn close(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.state = SessionState::Closed;
            session.sink = None;
            session.unacked.clear();
        }
    }

    /// Events queued and not yet acknowledged for `id`.
    pub fn pending(&self, id: SessionId) -> usize {
        self.sessions.get(&id).map(|s| s.unacked.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_sequenced_from_one() {
        let mut registry = SessionRegistry::new();
        registry.register(1);
        assert_eq!(registry.publish(1, 9, "message", b"a".to_vec()), Some(1));
        assert_eq!(registry.publish(1, 9, "message", b"b".to_vec()), Some(2));
        assert_eq!(registry.pending(1), 2);
        registry.ack(1, 9, 1);
        assert_eq!(registry.pending(1), 1);
    }

    #[test]
    fn acks_are_scoped_per_resource() {
        let mut registry = SessionRegistry::new();
        registry.register(1);
        registry.publish(1, 9, "message", b"for nine".to_vec());
        registry.publish(1, 10, "message", b"for ten".to_vec());

        // Acking resource 10's stream must not purge resource 9's earlier,
        // still-undelivered event.
        registry.ack(1, 10, 2);
        assert_eq!(registry.pending(1), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach(1, tx);
        let survivor = rx.try_recv().unwrap();
        assert_eq!(survivor.resource, 9);
        assert_eq!(survivor.seq, 1);

        registry.ack(1, 9, 1);
        assert_eq!(registry.pending(1), 0);
    }

    #[test]
    fn reconnect_replays_unacked_in_order() {
        let mut registry = SessionRegistry::new();
        registry.register(1);
        registry.publish(1, 9, "message", b"a".to_vec());
        registry.publish(1, 9, "message", b"b".to_vec());
        registry.detach(1);
        assert_eq!(registry.state(1), SessionState::Unstable);

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach(1, tx);
        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn expiry_drops_the_queue() {
        let mut registry = SessionRegistry::new();
        registry.register(1);
        registry.publish(1, 9, "message", b"a".to_vec());
        registry.expire(1);
        assert_eq!(registry.pending(1), 0);
        assert_eq!(registry.publish(1, 9, "message", b"b".to_vec()), None);
        assert!(!registry.is_open(1));
    }
}
