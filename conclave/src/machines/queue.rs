//! A replicated task queue with at-least-once dispatch.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::commit::Commit;
use crate::error::CoordinationResult;
use crate::machine::MachineContext;
use crate::machine::ResourceStateMachine;
use crate::SessionId;

/// Event topic carrying `(task_id, payload)` to the assigned consumer.
pub const PROCESS_TOPIC: &str = "process";
/// Event topic carrying `task_id` back to a synchronous submitter.
pub const ACK_TOPIC: &str = "ack";

/// Operations on a task queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueueOp {
    Subscribe,
    Unsubscribe,
    Submit {
        task_id: String,
        payload: Vec<u8>,
        /// When true the submitter waits for an `"ack"` event once the task
        /// has been processed.
        ack: bool,
    },
    Ack,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct TaskEnvelope {
    task_id: String,
    payload: Vec<u8>,
    submitter: SessionId,
    ack: bool,
}

/// State machine for a task queue.
///
/// Every task is either in `pending`, in exactly one consumer's in-flight
/// slot, or already acknowledged. A consumer's death requeues its in-flight
/// task at the head of `pending`, which preserves at-least-once delivery and
/// best-effort FIFO ordering; strict ordering may be violated after a
/// consumer failure.
#[derive(Default)]
pub struct TaskQueueMachine {
    pending: VecDeque<TaskEnvelope>,
    inflight: BTreeMap<SessionId, TaskEnvelope>,
    consumers: Vec<SessionId>,
    ack_waiters: BTreeMap<String, Commit>,
}

impl TaskQueueMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first subscribed consumer with a free in-flight slot.
    fn free_consumer(&self) -> Option<SessionId> {
        self.consumers.iter().copied().find(|session| !self.inflight.contains_key(session))
    }

    /// Hand pending tasks to free consumers until one side runs dry.
    fn dispatch(&mut self, ctx: &mut MachineContext<'_>) {
        while let Some(consumer) = self.free_consumer() {
            let envelope = match self.pending.pop_front() {
                Some(envelope) => envelope,
                None => return,
            };
            self.assign(consumer, envelope, ctx);
        }
    }

    fn assign(&mut self, consumer: SessionId, envelope: TaskEnvelope, ctx: &mut MachineContext<'_>) {
        tracing::debug!(consumer, task_id = %envelope.task_id, "dispatching task");
        ctx.publish(consumer, PROCESS_TOPIC, &(&envelope.task_id, &envelope.payload));
        self.inflight.insert(consumer, envelope);
    }

    /// Requeue the session's in-flight task (if any) at the head of the
    /// queue and drop the session from the consumer ring.
    fn drop_consumer(&mut self, session: SessionId, ctx: &mut MachineContext<'_>) {
        if let Some(envelope) = self.inflight.remove(&session) {
            tracing::debug!(session, task_id = %envelope.task_id, "requeueing in-flight task");
            self.pending.push_front(envelope);
        }
        self.consumers.retain(|&c| c != session);
        self.dispatch(ctx);
    }
}

impl ResourceStateMachine for TaskQueueMachine {
    fn apply(&mut self, commit: Commit, ctx: &mut MachineContext<'_>) -> CoordinationResult<Vec<u8>> {
        let op = match commit.decode::<QueueOp>() {
            Ok(op) => op,
            Err(err) => {
                commit.close();
                return Err(err);
            }
        };
        match op {
            QueueOp::Subscribe => {
                let session = commit.session();
                if !self.consumers.contains(&session) {
                    self.consumers.push(session);
                    self.dispatch(ctx);
                }
                commit.close();
                codec::encode(&())
            }
            QueueOp::Unsubscribe => {
                self.drop_consumer(commit.session(), ctx);
                commit.close();
                codec::encode(&())
            }
            QueueOp::Submit { task_id, payload, ack } => {
                let envelope = TaskEnvelope {
                    task_id: task_id.clone(),
                    payload,
                    submitter: commit.session(),
                    ack,
                };
                if ack {
                    self.ack_waiters.insert(task_id, commit);
                } else {
                    commit.close();
                }
                match self.free_consumer() {
                    Some(consumer) => self.assign(consumer, envelope, ctx),
                    None => self.pending.push_back(envelope),
                }
                codec::encode(&())
            }
            QueueOp::Ack => {
                let session = commit.session();
                let acked = match self.inflight.remove(&session) {
                    Some(envelope) => {
                        if let Some(waiter) = self.ack_waiters.remove(&envelope.task_id) {
                            ctx.publish(waiter.session(), ACK_TOPIC, &envelope.task_id);
                            waiter.close();
                        }
                        self.dispatch(ctx);
                        true
                    }
                    None => false,
                };
                commit.close();
                codec::encode(&acked)
            }
        }
    }

    fn session_closed(&mut self, session: SessionId, ctx: &mut MachineContext<'_>) {
        self.drop_consumer(session, ctx);
    }

    fn session_expired(&mut self, session: SessionId, ctx: &mut MachineContext<'_>) {
        self.drop_consumer(session, ctx);
    }

    fn delete(&mut self, _ctx: &mut MachineContext<'_>) {
        for (_, waiter) in std::mem::take(&mut self.ack_waiters) {
            waiter.close();
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        let pending: Vec<&TaskEnvelope> = self.pending.iter().collect();
        let waiters: Vec<&String> = self.ack_waiters.keys().collect();
        serde_json::to_vec(&(pending, &self.inflight, &self.consumers, waiters)).expect("queue snapshot encoding")
    }
}
