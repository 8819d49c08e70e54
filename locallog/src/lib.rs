//! An in-memory, single-process implementation of the conclave protocol host.
//!
//! `LocalCluster` stands in for the consensus engine on both sides of the
//! seam: it keeps one ordered log, applies every committed entry to a
//! [`ResourceManager`] in order, hands out [`ProtocolSession`] handles to
//! clients, and pumps the per-session event outboxes to them. Time is a
//! manual clock that only advances through log entries, so a cluster's
//! history can be replayed deterministically — which is exactly what the
//! framework's integration tests assert.
//!
//! Session lifecycle transitions (open, close, expiry) and clock ticks are
//! log entries too; replaying the log on a fresh manager reproduces the live
//! manager's state byte for byte.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tracing_futures::Instrument;

use conclave::client::membership::Connector;
use conclave::codec;
use conclave::commit::Commit;
use conclave::commit::CommitLedger;
use conclave::error::CoordinationError;
use conclave::error::CoordinationResult;
use conclave::manager::ResourceManager;
use conclave::protocol::ResourceRequest;
use conclave::resource::TypeRegistry;
use conclave::session::SessionEvent;
use conclave::session::SessionState;
use conclave::ClientState;
use conclave::ProtocolSession;
use conclave::ResourceId;
use conclave::SessionId;

/// Errors raised by the host's test-control surface.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

/// One committed entry of the in-memory log.
///
/// Session lifecycle and clock ticks are entries so that replay sees the
/// exact history the live manager saw.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum HostEntry {
    OpenSession { session: SessionId },
    CloseSession { session: SessionId },
    ExpireSession { session: SessionId },
    Tick,
    Request { session: SessionId, payload: Vec<u8> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LogRecord {
    index: u64,
    timestamp: u64,
    entry: HostEntry,
}

struct SessionMeta {
    state_tx: watch::Sender<ClientState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

struct HostState {
    manager: ResourceManager,
    registry: TypeRegistry,
    log: Vec<LogRecord>,
    clock: u64,
    next_index: u64,
    next_session: SessionId,
    sessions: BTreeMap<SessionId, SessionMeta>,
}

impl HostState {
    /// Append one entry to the log and apply it. Commands are the only
    /// entries producing a response.
    fn append_and_apply(&mut self, entry: HostEntry) -> Option<CoordinationResult<Vec<u8>>> {
        let record = LogRecord {
            index: self.next_index,
            timestamp: self.clock,
            entry,
        };
        self.next_index += 1;
        let response = apply_record(&mut self.manager, &record);
        self.log.push(record);
        response
    }

    /// Apply a query against current state, off the log.
    fn apply_query(&mut self, session: SessionId, request: &ResourceRequest) -> CoordinationResult<Vec<u8>> {
        let payload = codec::encode(request)?;
        let commit = Commit::new(
            self.next_index.saturating_sub(1),
            session,
            self.clock,
            request.compaction_mode(),
            payload,
            self.manager.ledger(),
        );
        self.manager.apply(commit)
    }

    /// Open a fresh transport for `session`: an attach that replays unacked
    /// events, and a pump task forwarding them to the client's broadcast.
    fn open_transport(&mut self, session: SessionId, events_tx: broadcast::Sender<SessionEvent>) {
        let (sink, mut source) = mpsc::unbounded_channel::<SessionEvent>();
        self.manager.sessions_mut().attach(session, sink);
        tokio::spawn(
            async move {
                while let Some(event) = source.recv().await {
                    // No receivers just means nobody is listening yet; the
                    // outbox keeps the event for redelivery either way.
                    let _ = events_tx.send(event);
                }
            }
            .instrument(tracing::debug_span!("event-pump", session)),
        );
    }
}

/// Apply one log record to a manager. Shared between the live path and
/// replay.
fn apply_record(manager: &mut ResourceManager, record: &LogRecord) -> Option<CoordinationResult<Vec<u8>>> {
    match &record.entry {
        HostEntry::OpenSession { session } => {
            manager.advance_time(record.timestamp);
            manager.sessions_mut().register(*session);
            None
        }
        HostEntry::CloseSession { session } => {
            manager.advance_time(record.timestamp);
            manager.session_closed(*session);
            None
        }
        HostEntry::ExpireSession { session } => {
            manager.advance_time(record.timestamp);
            manager.session_expired(*session);
            None
        }
        HostEntry::Tick => {
            manager.advance_time(record.timestamp);
            None
        }
        HostEntry::Request { session, payload } => {
            let mode = match codec::decode::<ResourceRequest>(payload) {
                Ok(request) => request.compaction_mode(),
                Err(err) => {
                    tracing::error!(index = record.index, error = %err, "undecodable log entry");
                    return Some(Err(err));
                }
            };
            let commit = Commit::new(record.index, *session, record.timestamp, mode, payload.clone(), manager.ledger());
            Some(manager.apply(commit))
        }
    }
}

/// An in-memory conclave cluster. Clones share the same host.
#[derive(Clone)]
pub struct LocalCluster {
    state: Arc<Mutex<HostState>>,
    ledger: CommitLedger,
}

impl LocalCluster {
    /// A cluster hosting the built-in resource types.
    pub fn new() -> Self {
        Self::with_registry(TypeRegistry::with_builtin())
    }

    pub fn with_registry(registry: TypeRegistry) -> Self {
        let manager = ResourceManager::new(registry.clone());
        let ledger = manager.ledger();
        let state = HostState {
            manager,
            registry,
            log: Vec::new(),
            clock: 0,
            next_index: 1,
            next_session: 1,
            sessions: BTreeMap::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            ledger,
        }
    }

    /// The live manager's commit-conservation ledger.
    pub fn ledger(&self) -> CommitLedger {
        self.ledger.clone()
    }

    /// Open a new client session in `Connected` state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn open_session(&self) -> Arc<LocalSession> {
        let mut state = self.state.lock().await;
        let session = state.next_session;
        state.next_session += 1;
        state.append_and_apply(HostEntry::OpenSession { session });

        let (state_tx, state_rx) = watch::channel(ClientState::Connected);
        let (events_tx, _) = broadcast::channel(1024);
        state.open_transport(session, events_tx.clone());
        state.sessions.insert(
            session,
            SessionMeta {
                state_tx,
                events_tx: events_tx.clone(),
            },
        );
        tracing::debug!(session, "session opened");

        Arc::new(LocalSession {
            id: session,
            cluster: self.clone(),
            state_rx,
            events_tx,
        })
    }

    /// Advance the manual clock, firing due timers through a logged tick.
    pub async fn advance_clock(&self, ms: u64) {
        let mut state = self.state.lock().await;
        state.clock += ms;
        state.append_and_apply(HostEntry::Tick);
    }

    /// Expire a session, as if its keep-alives lapsed beyond the timeout.
    pub async fn expire_session(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let meta = state.sessions.get(&session).ok_or(HostError::UnknownSession(session))?;
        let _ = meta.state_tx.send(ClientState::Closed);
        state.append_and_apply(HostEntry::ExpireSession { session });
        tracing::debug!(session, "session expired");
        Ok(())
    }

    /// Sever a session's transport without touching its server-side state.
    /// Events queue for redelivery; the client surfaces `Suspended`.
    pub async fn disconnect(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let meta = state.sessions.get(&session).ok_or(HostError::UnknownSession(session))?;
        let _ = meta.state_tx.send(ClientState::Suspended);
        state.manager.sessions_mut().detach(session);
        tracing::debug!(session, "session disconnected");
        Ok(())
    }

    /// Re-attach a disconnected session. Unacknowledged events are replayed
    /// in order before anything new is delivered.
    pub async fn reconnect(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock().await;
        let meta = state.sessions.get(&session).ok_or(HostError::UnknownSession(session))?;
        let events_tx = meta.events_tx.clone();
        let _ = meta.state_tx.send(ClientState::Connected);
        state.open_transport(session, events_tx);
        tracing::debug!(session, "session reconnected");
        Ok(())
    }

    /// A deterministic digest of the live manager's state.
    pub async fn digest(&self) -> Vec<u8> {
        self.state.lock().await.manager.digest()
    }

    /// Replay the full log on a fresh manager and digest the result. Equal
    /// to [`digest`](Self::digest) on a correct host.
    pub async fn replay_digest(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let mut manager = ResourceManager::new(state.registry.clone());
        for record in &state.log {
            apply_record(&mut manager, record);
        }
        manager.digest()
    }

    pub async fn resource_count(&self) -> usize {
        self.state.lock().await.manager.resource_count()
    }

    /// Events queued and not yet acknowledged for `session`.
    pub async fn pending_events(&self, session: SessionId) -> usize {
        self.state.lock().await.manager.sessions().pending(session)
    }

    pub async fn log_len(&self) -> usize {
        self.state.lock().await.log.len()
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session against a [`LocalCluster`].
pub struct LocalSession {
    id: SessionId,
    cluster: LocalCluster,
    state_rx: watch::Receiver<ClientState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl ProtocolSession for LocalSession {
    fn id(&self) -> SessionId {
        self.id
    }

    #[tracing::instrument(level = "debug", skip(self, request), fields(session = self.id))]
    async fn submit(&self, request: ResourceRequest) -> CoordinationResult<Vec<u8>> {
        let mut state = self.cluster.state.lock().await;
        match state.manager.sessions().state(self.id) {
            SessionState::Open => {}
            SessionState::Unstable => {
                return Err(CoordinationError::Unavailable("session is suspended".into()));
            }
            SessionState::Expired => return Err(CoordinationError::SessionExpired(self.id)),
            SessionState::Closed => {
                return Err(CoordinationError::IllegalState("session is closed".into()));
            }
        }

        if request.is_query() {
            // Queries bypass the log; the declared read consistency decides
            // where they could be served, which collapses to "here" for a
            // single-node host.
            return state.apply_query(self.id, &request);
        }

        let payload = codec::encode(&request)?;
        state
            .append_and_apply(HostEntry::Request {
                session: self.id,
                payload,
            })
            .expect("command entry must produce a response")
    }

    async fn acknowledge(&self, resource: ResourceId, seq: u64) -> CoordinationResult<()> {
        let mut state = self.cluster.state.lock().await;
        state.manager.sessions_mut().ack(self.id, resource, seq);
        Ok(())
    }

    fn states(&self) -> watch::Receiver<ClientState> {
        self.state_rx.clone()
    }

    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    async fn close(&self) -> CoordinationResult<()> {
        let mut state = self.cluster.state.lock().await;
        if let Some(meta) = state.sessions.get(&self.id) {
            let _ = meta.state_tx.send(ClientState::Closed);
        }
        state.append_and_apply(HostEntry::CloseSession { session: self.id });
        Ok(())
    }
}

/// Connects gateways to a [`LocalCluster`], ignoring the seed address.
pub struct LocalConnector {
    cluster: LocalCluster,
}

impl LocalConnector {
    pub fn new(cluster: LocalCluster) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _address: &str) -> CoordinationResult<Arc<dyn ProtocolSession>> {
        let session: Arc<dyn ProtocolSession> = self.cluster.open_session().await;
        Ok(session)
    }
}
