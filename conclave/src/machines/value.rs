//! A replicated opaque value with optional TTL eviction.

use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::commit::Commit;
use crate::error::CoordinationResult;
use crate::machine::MachineContext;
use crate::machine::ResourceStateMachine;
use crate::machine::TimerId;

/// Operations on a replicated value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueOp {
    /// Read the current payload.
    Get,
    /// Replace the payload. `ttl_ms = 0` means no expiry.
    Set { value: Vec<u8>, ttl_ms: u64 },
    /// Replace the payload iff the current one equals `expect` (deep
    /// equality; two absent payloads compare equal).
    CompareAndSet {
        expect: Option<Vec<u8>>,
        update: Option<Vec<u8>>,
        ttl_ms: u64,
    },
    /// Replace the payload, returning the previous one. `None` clears.
    GetAndSet { value: Option<Vec<u8>>, ttl_ms: u64 },
}

/// State machine for a replicated value.
///
/// At most one owner commit is live at any time: every write first closes
/// the previous owner (and cancels its eviction timer) before installing
/// itself. Invariant: `payload` is present iff an owner commit is held.
#[derive(Default)]
pub struct ValueMachine {
    payload: Option<Vec<u8>>,
    owner: Option<Commit>,
    timer: Option<TimerId>,
}

impl ValueMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the current owner commit and cancel its eviction timer.
    fn clean(&mut self, ctx: &mut MachineContext<'_>) {
        if let Some(owner) = self.owner.take() {
            owner.close();
        }
        if let Some(timer) = self.timer.take() {
            ctx.cancel(timer);
        }
    }

    fn install(&mut self, value: Vec<u8>, ttl_ms: u64, commit: Commit, ctx: &mut MachineContext<'_>) {
        self.payload = Some(value);
        if ttl_ms > 0 {
            self.timer = Some(ctx.schedule(commit.timestamp() + ttl_ms));
        }
        self.owner = Some(commit);
    }

    /// Install `value` when present, otherwise clear; the incoming commit is
    /// only retained while a payload exists.
    fn replace(&mut self, value: Option<Vec<u8>>, ttl_ms: u64, commit: Commit, ctx: &mut MachineContext<'_>) {
        self.clean(ctx);
        match value {
            Some(value) => self.install(value, ttl_ms, commit, ctx),
            None => {
                self.payload = None;
                commit.close();
            }
        }
    }
}

impl ResourceStateMachine for ValueMachine {
    fn apply(&mut self, commit: Commit, ctx: &mut MachineContext<'_>) -> CoordinationResult<Vec<u8>> {
        let op = match commit.decode::<ValueOp>() {
            Ok(op) => op,
            Err(err) => {
                commit.close();
                return Err(err);
            }
        };
        match op {
            ValueOp::Get => {
                let response = codec::encode(&self.payload);
                commit.close();
                response
            }
            ValueOp::Set { value, ttl_ms } => {
                self.replace(Some(value), ttl_ms, commit, ctx);
                codec::encode(&())
            }
            ValueOp::CompareAndSet { expect, update, ttl_ms } => {
                if self.payload == expect {
                    self.replace(update, ttl_ms, commit, ctx);
                    codec::encode(&true)
                } else {
                    commit.close();
                    codec::encode(&false)
                }
            }
            ValueOp::GetAndSet { value, ttl_ms } => {
                let previous = self.payload.clone();
                self.replace(value, ttl_ms, commit, ctx);
                codec::encode(&previous)
            }
        }
    }

    fn timeout(&mut self, timer: TimerId, _ctx: &mut MachineContext<'_>) {
        // The closure reads the then-current owner, not the commit that
        // scheduled it: a newer write supersedes the timer it canceled.
        if self.timer != Some(timer) {
            return;
        }
        self.timer = None;
        self.payload = None;
        if let Some(owner) = self.owner.take() {
            tracing::debug!(index = owner.index(), "value expired");
            owner.close();
        }
    }

    fn delete(&mut self, ctx: &mut MachineContext<'_>) {
        self.clean(ctx);
        self.payload = None;
    }

    fn snapshot(&self) -> Vec<u8> {
        let owner_index = self.owner.as_ref().map(|c| c.index());
        serde_json::to_vec(&(&self.payload, owner_index)).expect("value snapshot encoding")
    }
}
