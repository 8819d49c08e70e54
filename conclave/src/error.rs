//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

use crate::ResourceId;
use crate::ResourceTypeId;
use crate::SessionId;

/// A result type whose error half is surfaced to callers unchanged.
pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// Error variants surfaced by resource operations.
///
/// Configuration and routing errors (`NoSuchResource`, `UnknownType`,
/// `TypeMismatch`, `CodecConflict`, `InvalidArgument`) are never retried.
/// `Timeout` and `Unavailable` are transient and retried by the Raft client
/// up to its policy before reaching the caller. `SessionExpired` is fatal for
/// the session: the gateway transitions to `Closed` and every pending future
/// fails with it.
///
/// Invariant violations *inside* a state machine are not represented here:
/// a divergent state machine is worse than a stopped one, so those panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum CoordinationError {
    #[error("no resource with id {0}")]
    NoSuchResource(ResourceId),

    #[error("resource type {0} is not registered")]
    UnknownType(ResourceTypeId),

    #[error("key {key:?} is already bound to resource type {existing}")]
    TypeMismatch { key: String, existing: ResourceTypeId },

    #[error("conflicting codec registration for type id {0}")]
    CodecConflict(ResourceTypeId),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinationError {
    /// True when retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::Timeout(_) | CoordinationError::Unavailable(_))
    }

    /// True when the owning session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoordinationError::SessionExpired(_))
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(err: serde_json::Error) -> Self {
        CoordinationError::Internal(format!("codec: {}", err))
    }
}
