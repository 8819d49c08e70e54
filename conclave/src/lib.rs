//! Conclave: replicated coordination primitives multiplexed over a Raft log.
//!
//! A conclave cluster exposes named, replicated stateful objects — values,
//! multimaps, pub/sub topics, task queues — to any number of client sessions.
//! Ordering and durability come from an external Raft consensus engine; this
//! crate owns everything above it: the resource manager state machine which
//! multiplexes many logical resources onto one log, the per-resource state
//! machines, the session/event fan-out protocol, and the typed client
//! gateways.
//!
//! The consensus engine is consumed through two narrow seams:
//!
//! - clients drive a [`ProtocolSession`] — submit an operation, watch
//!   connection state, consume the event stream;
//! - the server-side host feeds committed entries to
//!   [`manager::ResourceManager::apply`] in log order and drains the
//!   per-session event outboxes.
//!
//! The sibling `locallog` crate provides an in-memory implementation of both
//! seams which the integration tests are written against.

pub mod client;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod machine;
pub mod machines;
pub mod manager;
pub mod protocol;
pub mod resource;
pub mod session;

use tokio::sync::broadcast;
use tokio::sync::watch;

pub use async_trait::async_trait;

pub use crate::client::ResourceClient;
pub use crate::commit::Commit;
pub use crate::commit::CommitLedger;
pub use crate::config::Config;
pub use crate::config::ResourceConfig;
pub use crate::error::CoordinationError;
pub use crate::error::CoordinationResult;
pub use crate::manager::ResourceManager;
pub use crate::protocol::ReadConsistency;
pub use crate::protocol::ResourceRequest;
pub use crate::protocol::WriteConsistency;
pub use crate::resource::ResourceType;
pub use crate::resource::TypeRegistry;
pub use crate::session::SessionEvent;

/// A Raft node's ID.
pub type NodeId = u64;

/// The ID of one client session, assigned by the cluster on connect.
pub type SessionId = u64;

/// The ID of one named resource, assigned by the resource manager on create.
pub type ResourceId = u64;

/// The stable integer ID of a resource type.
///
/// Negative values below -30 are reserved for the types shipped with this
/// crate; applications register positive IDs.
pub type ResourceTypeId = i16;

/// The client-visible connection state of a session.
///
/// Maps 1:1 from the underlying Raft client: linearizability holds for any
/// operation submitted and completed while the state remains `Connected`;
/// weaker outcomes only occur across a `Suspended` interval and are always
/// surfaced through this state, never silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Suspended,
    Closed,
}

/// A trait defining the summary of a message for logging purposes.
pub trait MessageSummary {
    /// Return a string of a big message for logging.
    fn summary(&self) -> String;
}

/// The client half of the consensus engine, as consumed by resource gateways.
///
/// One value of this type is one logical session with the cluster: a single
/// total order for its writes, a keep-alive lifecycle, and an ordered
/// at-least-once event stream fanned out from the server-side state machines.
#[async_trait]
pub trait ProtocolSession: Send + Sync + 'static {
    /// The cluster-assigned ID of this session.
    fn id(&self) -> SessionId;

    /// Submit one operation and resolve with the state machine's encoded
    /// response once the entry has been committed and applied.
    async fn submit(&self, request: ResourceRequest) -> CoordinationResult<Vec<u8>>;

    /// Acknowledge receipt of every event published by `resource` up to and
    /// including `seq`. Acks are scoped per resource so that the handles
    /// sharing this session never purge each other's undelivered events.
    async fn acknowledge(&self, resource: ResourceId, seq: u64) -> CoordinationResult<()>;

    /// Watch connection state transitions for this session.
    fn states(&self) -> watch::Receiver<ClientState>;

    /// Subscribe to the session's event stream.
    ///
    /// Events are delivered in sequence order; unacknowledged events are
    /// redelivered after a reconnect to the same session.
    fn events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Close the session. Pending operations fail; the state transitions to
    /// `Closed`.
    async fn close(&self) -> CoordinationResult<()>;
}
