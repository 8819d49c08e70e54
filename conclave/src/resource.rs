//! Resource type descriptors and the type registry.

use std::collections::BTreeMap;
use std::fmt;

use crate::codec::CodecEntry;
use crate::config::ResourceConfig;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::machine::ResourceStateMachine;
use crate::machines::MultiMapMachine;
use crate::machines::TaskQueueMachine;
use crate::machines::TopicMachine;
use crate::machines::ValueMachine;
use crate::protocol;
use crate::ResourceTypeId;

/// Stable ids of the resource types shipped with this crate.
pub const VALUE_TYPE_ID: ResourceTypeId = -40;
pub const MULTIMAP_TYPE_ID: ResourceTypeId = -41;
pub const TOPIC_TYPE_ID: ResourceTypeId = -42;
pub const TASK_QUEUE_TYPE_ID: ResourceTypeId = -32;

/// Describes one resource type: its stable id, the constructor for its
/// server-side state machine, and the codec bundle a gateway registers on
/// open.
///
/// Two resource types compare equal iff their ids match.
#[derive(Clone)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    pub name: &'static str,
    pub codec: &'static [CodecEntry],
    constructor: fn(&ResourceConfig) -> Box<dyn ResourceStateMachine>,
}

impl ResourceType {
    pub fn new(
        id: ResourceTypeId,
        name: &'static str,
        codec: &'static [CodecEntry],
        constructor: fn(&ResourceConfig) -> Box<dyn ResourceStateMachine>,
    ) -> Self {
        Self { id, name, codec, constructor }
    }

    /// Instantiate the server-side state machine for this type.
    pub fn instantiate(&self, config: &ResourceConfig) -> Box<dyn ResourceStateMachine> {
        (self.constructor)(config)
    }
}

impl PartialEq for ResourceType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ResourceType {}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceType").field("id", &self.id).field("name", &self.name).finish()
    }
}

/// The replicated value type.
pub fn value_type() -> ResourceType {
    static CODEC: &[CodecEntry] = &[
        CodecEntry { id: protocol::TYPE_RESOURCE_COMMAND, name: "conclave/command" },
        CodecEntry { id: protocol::TYPE_RESOURCE_QUERY, name: "conclave/query" },
        CodecEntry { id: VALUE_TYPE_ID, name: "conclave/value" },
    ];
    ResourceType::new(VALUE_TYPE_ID, "value", CODEC, |_| Box::new(ValueMachine::new()))
}

/// The replicated multimap type.
pub fn multimap_type() -> ResourceType {
    static CODEC: &[CodecEntry] = &[
        CodecEntry { id: protocol::TYPE_RESOURCE_COMMAND, name: "conclave/command" },
        CodecEntry { id: protocol::TYPE_RESOURCE_QUERY, name: "conclave/query" },
        CodecEntry { id: MULTIMAP_TYPE_ID, name: "conclave/multimap" },
    ];
    ResourceType::new(MULTIMAP_TYPE_ID, "multimap", CODEC, |config| Box::new(MultiMapMachine::new(config)))
}

/// The pub/sub topic type.
pub fn topic_type() -> ResourceType {
    static CODEC: &[CodecEntry] = &[
        CodecEntry { id: protocol::TYPE_RESOURCE_COMMAND, name: "conclave/command" },
        CodecEntry { id: protocol::TYPE_RESOURCE_QUERY, name: "conclave/query" },
        CodecEntry { id: TOPIC_TYPE_ID, name: "conclave/topic" },
    ];
    ResourceType::new(TOPIC_TYPE_ID, "topic", CODEC, |_| Box::new(TopicMachine::new()))
}

/// The task queue type.
pub fn task_queue_type() -> ResourceType {
    static CODEC: &[CodecEntry] = &[
        CodecEntry { id: protocol::TYPE_RESOURCE_COMMAND, name: "conclave/command" },
        CodecEntry { id: protocol::TYPE_RESOURCE_QUERY, name: "conclave/query" },
        CodecEntry { id: TASK_QUEUE_TYPE_ID, name: "conclave/task-queue" },
    ];
    ResourceType::new(TASK_QUEUE_TYPE_ID, "task-queue", CODEC, |_| Box::new(TaskQueueMachine::new()))
}

/// Maps resource type ids to their descriptors. Loaded once at host startup;
/// duplicate ids are rejected.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    by_id: BTreeMap<ResourceTypeId, ResourceType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the four types shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for rtype in [value_type(), multimap_type(), topic_type(), task_queue_type()] {
            registry.register(rtype).expect("builtin type ids collide");
        }
        registry
    }

    pub fn register(&mut self, rtype: ResourceType) -> CoordinationResult<()> {
        if rtype.id == 0 {
            return Err(CoordinationError::InvalidArgument("resource type id must be non-zero".into()));
        }
        if self.by_id.contains_key(&rtype.id) {
            return Err(CoordinationError::CodecConflict(rtype.id));
        }
        self.by_id.insert(rtype.id, rtype);
        Ok(())
    }

    pub fn get(&self, id: ResourceTypeId) -> Option<&ResourceType> {
        self.by_id.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_compare_by_id() {
        assert_eq!(value_type(), value_type());
        assert_ne!(value_type(), topic_type());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = TypeRegistry::with_builtin();
        let err = registry.register(value_type()).unwrap_err();
        assert_eq!(err, CoordinationError::CodecConflict(VALUE_TYPE_ID));
    }

    #[test]
    fn zero_id_is_rejected() {
        let mut registry = TypeRegistry::new();
        let bogus = ResourceType::new(0, "bogus", &[], |_| Box::new(ValueMachine::new()));
        assert!(registry.register(bogus).is_err());
    }
}
