//! A replicated pub/sub topic.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::commit::Commit;
use crate::error::CoordinationResult;
use crate::machine::MachineContext;
use crate::machine::ResourceStateMachine;
use crate::SessionId;

/// The event topic messages are fanned out under.
pub const MESSAGE_TOPIC: &str = "message";

/// Operations on a topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TopicOp {
    Listen,
    Unlisten,
    Publish { message: Vec<u8> },
}

/// State machine for a pub/sub topic.
///
/// The subscription is the retained `Listen` commit: it pins its log entry
/// for exactly as long as the subscriber stays registered, and closing it is
/// what releases the entry when the subscriber leaves or its session dies.
#[derive(Default)]
pub struct TopicMachine {
    subscribers: BTreeMap<SessionId, Commit>,
}

impl TopicMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn unsubscribe(&mut self, session: SessionId) -> bool {
        match self.subscribers.remove(&session) {
            Some(retained) => {
                retained.close();
                true
            }
            None => false,
        }
    }
}

impl ResourceStateMachine for TopicMachine {
    fn apply(&mut self, commit: Commit, ctx: &mut MachineContext<'_>) -> CoordinationResult<Vec<u8>> {
        let op = match commit.decode::<TopicOp>() {
            Ok(op) => op,
            Err(err) => {
                commit.close();
                return Err(err);
            }
        };
        match op {
            TopicOp::Listen => {
                let session = commit.session();
                if self.subscribers.contains_key(&session) {
                    // Already listening; nothing new to retain.
                    commit.close();
                } else {
                    self.subscribers.insert(session, commit);
                }
                codec::encode(&())
            }
            TopicOp::Unlisten => {
                let removed = self.unsubscribe(commit.session());
                commit.close();
                codec::encode(&removed)
            }
            TopicOp::Publish { message } => {
                // Session-id order for determinism across replicas.
                let mut delivered = 0u64;
                let mut dead = Vec::new();
                for (&session, _) in self.subscribers.iter() {
                    if ctx.publish_raw(session, MESSAGE_TOPIC, message.clone()) {
                        delivered += 1;
                    } else {
                        dead.push(session);
                    }
                }
                for session in dead {
                    self.unsubscribe(session);
                }
                commit.close();
                codec::encode(&delivered)
            }
        }
    }

    fn session_closed(&mut self, session: SessionId, _ctx: &mut MachineContext<'_>) {
        self.unsubscribe(session);
    }

    fn session_expired(&mut self, session: SessionId, _ctx: &mut MachineContext<'_>) {
        self.unsubscribe(session);
    }

    fn delete(&mut self, _ctx: &mut MachineContext<'_>) {
        for (_, retained) in std::mem::take(&mut self.subscribers) {
            retained.close();
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let sessions: Vec<SessionId> = self.subscribers.keys().copied().collect();
        serde_json::to_vec(&sessions).expect("topic snapshot encoding")
    }
}
