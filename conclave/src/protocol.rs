//! The operation envelope and its wire framing.

use serde::Deserialize;
use serde::Serialize;

use crate::config::ResourceConfig;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::MessageSummary;
use crate::ResourceId;
use crate::ResourceTypeId;

/// Stable operation type ids registered with the serializer.
pub const TYPE_RESOURCE_COMMAND: ResourceTypeId = -50;
pub const TYPE_RESOURCE_QUERY: ResourceTypeId = -51;
pub const TYPE_CONFIGURE: ResourceTypeId = -52;
pub const TYPE_DELETE: ResourceTypeId = -53;

/// Consistency declared per write operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConsistency {
    /// Full linearizable round through the leader.
    Atomic,
    /// Linearizable under the leader's lease.
    AtomicLease,
    /// Sequential per-session ordering.
    Sequential,
    /// Sequential, and events published by the commit are flushed before the
    /// response completes.
    SequentialEvent,
}

impl WriteConsistency {
    pub fn tag(self) -> u8 {
        match self {
            WriteConsistency::Atomic => 0,
            WriteConsistency::AtomicLease => 1,
            WriteConsistency::Sequential => 2,
            WriteConsistency::SequentialEvent => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(WriteConsistency::Atomic),
            1 => Some(WriteConsistency::AtomicLease),
            2 => Some(WriteConsistency::Sequential),
            3 => Some(WriteConsistency::SequentialEvent),
            _ => None,
        }
    }
}

/// Consistency declared per read operation, determining where the query may
/// be served.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Full linearizable round through the leader.
    Atomic,
    /// Served by the leader while it holds its lease.
    AtomicLease,
    /// Sequential per-session ordering.
    Sequential,
    /// May be served by a follower that has seen this session's writes.
    Causal,
    /// May be served by any follower, with lag tolerance.
    Local,
}

impl ReadConsistency {
    /// True when the query may short-circuit at a follower.
    pub fn follower_serveable(self) -> bool {
        matches!(self, ReadConsistency::Causal | ReadConsistency::Local)
    }

    /// True when the query requires the leader's lease, not a full round.
    pub fn requires_lease(self) -> bool {
        matches!(self, ReadConsistency::AtomicLease)
    }

    pub fn tag(self) -> u8 {
        match self {
            ReadConsistency::Atomic => 0,
            ReadConsistency::AtomicLease => 1,
            ReadConsistency::Sequential => 2,
            ReadConsistency::Causal => 3,
            ReadConsistency::Local => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ReadConsistency::Atomic),
            1 => Some(ReadConsistency::AtomicLease),
            2 => Some(ReadConsistency::Sequential),
            3 => Some(ReadConsistency::Causal),
            4 => Some(ReadConsistency::Local),
            _ => None,
        }
    }
}

/// Compaction eligibility declared by an envelope for its log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionMode {
    /// The entry records state and must survive until quorum-compacted.
    Quorum,
    /// The entry's effect is fully captured by later entries.
    Release,
    /// The entry deletes state; retained until the deletion is compacted.
    Tombstone,
}

/// One resource-level operation, as carried by the Raft log (commands) or the
/// query path (queries).
///
/// `Get`, `GetIfExists`, `Close`, `Delete` and `Configure` are handled by the
/// resource manager itself; `Command` and `Query` are forwarded to the owning
/// per-resource state machine with the commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResourceRequest {
    /// Look up `(key, type)`, creating the resource if absent, and register
    /// the calling session as an owner.
    Get { key: String, type_id: ResourceTypeId },
    /// Look up `(key, type)` without creating.
    GetIfExists { key: String, type_id: ResourceTypeId },
    /// Drop the calling session's ownership. The resource itself persists.
    Close { id: ResourceId },
    /// Delete the resource and evict its state machine.
    Delete { id: ResourceId },
    /// Replace the resource's replicated configuration.
    Configure { id: ResourceId, config: ResourceConfig },
    /// A state-mutating operation for one resource's state machine.
    Command {
        id: ResourceId,
        consistency: WriteConsistency,
        payload: Vec<u8>,
    },
    /// A read-only operation for one resource's state machine.
    Query {
        id: ResourceId,
        consistency: ReadConsistency,
        payload: Vec<u8>,
    },
}

impl ResourceRequest {
    /// The compaction mode this envelope declares for its log entry.
    pub fn compaction_mode(&self) -> CompactionMode {
        match self {
            ResourceRequest::Get { .. } | ResourceRequest::Configure { .. } | ResourceRequest::Command { .. } => {
                CompactionMode::Quorum
            }
            ResourceRequest::GetIfExists { .. } | ResourceRequest::Query { .. } => CompactionMode::Release,
            ResourceRequest::Close { .. } | ResourceRequest::Delete { .. } => CompactionMode::Tombstone,
        }
    }

    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            ResourceRequest::Get { .. } | ResourceRequest::GetIfExists { .. } => None,
            ResourceRequest::Close { id }
            | ResourceRequest::Delete { id }
            | ResourceRequest::Configure { id, .. }
            | ResourceRequest::Command { id, .. }
            | ResourceRequest::Query { id, .. } => Some(*id),
        }
    }

    /// True for operations that never mutate resource state.
    pub fn is_query(&self) -> bool {
        matches!(self, ResourceRequest::Query { .. } | ResourceRequest::GetIfExists { .. })
    }
}

impl MessageSummary for ResourceRequest {
    fn summary(&self) -> String {
        match self {
            ResourceRequest::Get { key, type_id } => format!("get key={} type={}", key, type_id),
            ResourceRequest::GetIfExists { key, type_id } => format!("get-if-exists key={} type={}", key, type_id),
            ResourceRequest::Close { id } => format!("close id={}", id),
            ResourceRequest::Delete { id } => format!("delete id={}", id),
            ResourceRequest::Configure { id, .. } => format!("configure id={}", id),
            ResourceRequest::Command { id, consistency, payload } => {
                format!("command id={} consistency={:?} n={}", id, consistency, payload.len())
            }
            ResourceRequest::Query { id, consistency, payload } => {
                format!("query id={} consistency={:?} n={}", id, consistency, payload.len())
            }
        }
    }
}

/// Leading tag byte of every framed envelope.
pub const FRAME_TAG: u8 = 0xC1;

/// Encode one command/query frame:
/// `tag(u8) | resourceId:u64 | consistencyTag:u8 | payloadLen:u32 | payload`.
pub fn encode_frame(id: ResourceId, consistency_tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + 1 + 4 + payload.len());
    buf.push(FRAME_TAG);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(consistency_tag);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode one frame produced by [`encode_frame`].
pub fn decode_frame(buf: &[u8]) -> CoordinationResult<(ResourceId, u8, Vec<u8>)> {
    if buf.len() < 14 {
        return Err(CoordinationError::InvalidArgument(format!("frame too short: {} bytes", buf.len())));
    }
    if buf[0] != FRAME_TAG {
        return Err(CoordinationError::InvalidArgument(format!("unknown frame tag {:#x}", buf[0])));
    }
    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&buf[1..9]);
    let id = u64::from_be_bytes(id_bytes);
    let consistency_tag = buf[9];
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[10..14]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if buf.len() != 14 + len {
        return Err(CoordinationError::InvalidArgument(format!(
            "frame length mismatch: declared {}, have {}",
            len,
            buf.len() - 14
        )));
    }
    Ok((id, consistency_tag, buf[14..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let buf = encode_frame(42, WriteConsistency::Sequential.tag(), b"payload");
        let (id, tag, payload) = decode_frame(&buf).unwrap();
        assert_eq!(id, 42);
        assert_eq!(WriteConsistency::from_tag(tag), Some(WriteConsistency::Sequential));
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn frame_rejects_garbage() {
        assert!(decode_frame(b"short").is_err());

        let mut buf = encode_frame(1, 0, b"xy");
        buf[0] = 0x00;
        assert!(decode_frame(&buf).is_err());

        let mut truncated = encode_frame(1, 0, b"xyz");
        truncated.pop();
        assert!(decode_frame(&truncated).is_err());
    }

    #[test]
    fn follower_serveable_reads() {
        assert!(ReadConsistency::Local.follower_serveable());
        assert!(ReadConsistency::Causal.follower_serveable());
        assert!(!ReadConsistency::Atomic.follower_serveable());
        assert!(ReadConsistency::AtomicLease.requires_lease());
    }

    #[test]
    fn compaction_modes() {
        let cmd = ResourceRequest::Command {
            id: 1,
            consistency: WriteConsistency::Atomic,
            payload: vec![],
        };
        assert_eq!(cmd.compaction_mode(), CompactionMode::Quorum);
        assert_eq!(ResourceRequest::Delete { id: 1 }.compaction_mode(), CompactionMode::Tombstone);
        let query = ResourceRequest::Query {
            id: 1,
            consistency: ReadConsistency::Local,
            payload: vec![],
        };
        assert_eq!(query.compaction_mode(), CompactionMode::Release);
    }
}
