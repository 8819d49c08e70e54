//! The per-resource state machine contract and its host-side services.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::BTreeSet;

use serde::Serialize;

use crate::codec;
use crate::commit::Commit;
use crate::config::ResourceConfig;
use crate::error::CoordinationResult;
use crate::session::SessionRegistry;
use crate::ResourceId;
use crate::SessionId;

/// Identifies one scheduled timer. Unique within a host's lifetime.
pub type TimerId = u64;

/// Deterministic timer scheduling for the state-machine host.
///
/// Time never comes from the wall clock: it advances only with the
/// leader-assigned timestamps carried by committed log entries, so replaying
/// the same log fires the same timers in the same order on every node.
pub struct Timeline {
    due: BinaryHeap<Reverse<(u64, TimerId, ResourceId)>>,
    canceled: BTreeSet<TimerId>,
    next_timer: TimerId,
    now: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            due: BinaryHeap::new(),
            canceled: BTreeSet::new(),
            next_timer: 1,
            now: 0,
        }
    }

    /// The host's current notion of time, in ms since the epoch.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedule a timer for `resource` at `deadline`.
    pub fn schedule(&mut self, resource: ResourceId, deadline: u64) -> TimerId {
        let timer = self.next_timer;
        self.next_timer += 1;
        self.due.push(Reverse((deadline, timer, resource)));
        timer
    }

    pub fn cancel(&mut self, timer: TimerId) {
        self.canceled.insert(timer);
    }

    /// Advance time to `now`, returning every due timer in
    /// (deadline, schedule-order) order. Canceled timers are skipped.
    pub fn advance(&mut self, now: u64) -> Vec<(ResourceId, TimerId)> {
        if now > self.now {
            self.now = now;
        }
        let mut fired = Vec::new();
        while matches!(self.due.peek(), Some(Reverse((deadline, _, _))) if *deadline <= self.now) {
            let Reverse((_, timer, resource)) = self.due.pop().expect("peeked entry vanished");
            if self.canceled.remove(&timer) {
                continue;
            }
            fired.push((resource, timer));
        }
        fired
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

/// The host services available to a state machine while it applies a commit,
/// handles a timer, or reacts to a session transition.
///
/// Everything here runs on the host's single logical thread; nothing may
/// suspend or block.
pub struct MachineContext<'a> {
    pub(crate) resource: ResourceId,
    pub(crate) now: u64,
    pub(crate) timeline: &'a mut Timeline,
    pub(crate) sessions: &'a mut SessionRegistry,
}

impl<'a> MachineContext<'a> {
    /// The timestamp of the entry being applied, in ms since the epoch.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Schedule a timer owned by this resource.
    pub fn schedule(&mut self, deadline: u64) -> TimerId {
        self.timeline.schedule(self.resource, deadline)
    }

    pub fn cancel(&mut self, timer: TimerId) {
        self.timeline.cancel(timer);
    }

    pub fn session_open(&self, session: SessionId) -> bool {
        self.sessions.is_open(session)
    }

    /// Publish an event to `session`, encoding the payload. Returns false
    /// when the session can no longer receive events.
    pub fn publish<T: Serialize>(&mut self, session: SessionId, topic: &str, payload: &T) -> bool {
        match codec::encode(payload) {
            Ok(bytes) => self.publish_raw(session, topic, bytes),
            Err(err) => {
                tracing::error!(session, topic, error = %err, "failed to encode event payload");
                false
            }
        }
    }

    /// Publish an already-encoded event payload to `session`.
    pub fn publish_raw(&mut self, session: SessionId, topic: &str, payload: Vec<u8>) -> bool {
        self.sessions.publish(session, self.resource, topic, payload).is_some()
    }
}

/// Deterministic logic applied to the committed operations of one resource.
///
/// Hosted by the resource manager on a single logical thread: `apply`, timer
/// callbacks and session hooks are serialized against each other and run in
/// committed-log order. Implementations own every commit handed to them and
/// must close each exactly once — immediately for operations with no retained
/// state, or later for commit-as-subscription patterns where the commit pins
/// its log entry for as long as the derived state lives.
pub trait ResourceStateMachine: Send + 'static {
    /// Apply one committed operation and return the encoded response.
    fn apply(&mut self, commit: Commit, ctx: &mut MachineContext<'_>) -> CoordinationResult<Vec<u8>>;

    /// A timer scheduled through `ctx.schedule` has fired.
    fn timeout(&mut self, _timer: TimerId, _ctx: &mut MachineContext<'_>) {}

    /// The replicated configuration changed.
    fn configure(&mut self, _config: &ResourceConfig) {}

    /// A session owning this resource closed cleanly.
    fn session_closed(&mut self, _session: SessionId, _ctx: &mut MachineContext<'_>) {}

    /// A session owning this resource expired.
    fn session_expired(&mut self, _session: SessionId, _ctx: &mut MachineContext<'_>) {}

    /// The resource is being deleted; close every retained commit.
    fn delete(&mut self, _ctx: &mut MachineContext<'_>) {}

    /// A deterministic encoding of the machine's logical state, compared
    /// across replicas and replays.
    fn snapshot(&self) -> Vec<u8>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_then_schedule_order() {
        let mut timeline = Timeline::new();
        let a = timeline.schedule(1, 100);
        let b = timeline.schedule(2, 50);
        let c = timeline.schedule(3, 100);

        assert!(timeline.advance(49).is_empty());
        assert_eq!(timeline.advance(100), vec![(2, b), (1, a), (3, c)]);
    }

    #[test]
    fn canceled_timers_do_not_fire() {
        let mut timeline = Timeline::new();
        let a = timeline.schedule(1, 10);
        let b = timeline.schedule(1, 20);
        timeline.cancel(a);
        assert_eq!(timeline.advance(30), vec![(1, b)]);
    }

    #[test]
    fn time_never_runs_backwards() {
        let mut timeline = Timeline::new();
        timeline.advance(100);
        timeline.advance(50);
        assert_eq!(timeline.now(), 100);
    }
}
