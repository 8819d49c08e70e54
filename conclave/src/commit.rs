//! Commit handles and commit-conservation accounting.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::codec;
use crate::error::CoordinationResult;
use crate::protocol::CompactionMode;
use crate::SessionId;

/// Counts open commits across one state-machine host.
///
/// Compaction soundness requires that every applied log entry is eventually
/// closed exactly once; the ledger makes that testable. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct CommitLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    opened: AtomicU64,
    closed: AtomicU64,
    leaked: AtomicU64,
}

impl CommitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits applied so far.
    pub fn opened(&self) -> u64 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Commits closed so far.
    pub fn closed(&self) -> u64 {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Commits dropped without being closed. Always zero in a correct host.
    pub fn leaked(&self) -> u64 {
        self.inner.leaked.load(Ordering::SeqCst)
    }

    /// Commits currently held open, pinning their log entries.
    pub fn open_commits(&self) -> u64 {
        self.opened() - self.closed() - self.leaked()
    }

    fn on_open(&self) {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self) {
        self.inner.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_leak(&self) {
        self.inner.leaked.fetch_add(1, Ordering::SeqCst);
    }
}

/// A handle to one applied log entry, owned by exactly one state machine at a
/// time.
///
/// Closing a commit signals that the entry is eligible for compaction under
/// its declared mode and transfers ownership back to the log. `close`
/// consumes the handle, so a commit cannot be closed twice and its fields
/// cannot be read after close. A commit dropped without being closed is a
/// bug in the owning state machine; the ledger records it as a leak.
#[derive(Debug)]
pub struct Commit {
    index: u64,
    session: SessionId,
    timestamp: u64,
    mode: CompactionMode,
    payload: Vec<u8>,
    ledger: CommitLedger,
    closed: bool,
}

impl Commit {
    /// Host-side constructor, called once per applied log entry.
    pub fn new(
        index: u64,
        session: SessionId,
        timestamp: u64,
        mode: CompactionMode,
        payload: Vec<u8>,
        ledger: CommitLedger,
    ) -> Self {
        ledger.on_open();
        Self {
            index,
            session,
            timestamp,
            mode,
            payload,
            ledger,
            closed: false,
        }
    }

    /// The log index of the entry.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// The session that submitted the operation.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The leader-assigned timestamp of the entry, in ms since the epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn compaction_mode(&self) -> CompactionMode {
        self.mode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the operation carried by this commit.
    pub fn decode<T: DeserializeOwned>(&self) -> CoordinationResult<T> {
        codec::decode(&self.payload)
    }

    /// Re-target the commit at an inner payload, preserving its identity.
    ///
    /// Used by the resource manager when forwarding an envelope's inner
    /// operation: the commit stays the same log entry, so the ledger counters
    /// are untouched.
    pub(crate) fn map_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Close the commit, releasing the log entry for compaction.
    pub fn close(mut self) {
        self.closed = true;
        self.ledger.on_close();
    }
}

impl Drop for Commit {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(index = self.index, session = self.session, "commit dropped without close");
            self.ledger.on_leak();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(ledger: &CommitLedger) -> Commit {
        Commit::new(1, 7, 0, CompactionMode::Quorum, vec![], ledger.clone())
    }

    #[test]
    fn close_balances_the_ledger() {
        let ledger = CommitLedger::new();
        let c = commit(&ledger);
        assert_eq!(ledger.open_commits(), 1);
        c.close();
        assert_eq!(ledger.open_commits(), 0);
        assert_eq!(ledger.leaked(), 0);
    }

    #[test]
    fn dropped_commit_is_a_leak() {
        let ledger = CommitLedger::new();
        drop(commit(&ledger));
        assert_eq!(ledger.leaked(), 1);
        assert_eq!(ledger.open_commits(), 0);
    }

    #[test]
    fn map_payload_preserves_identity() {
        let ledger = CommitLedger::new();
        let c = commit(&ledger).map_payload(b"inner".to_vec());
        assert_eq!(ledger.opened(), 1);
        assert_eq!(c.payload(), b"inner");
        c.close();
        assert_eq!(ledger.open_commits(), 0);
    }
}
