//! The process-wide serializer registry.
//!
//! Every resource type carries a codec bundle: the `(type id, name)` pairs it
//! needs registered before its operations can travel. Registration happens
//! once per gateway open and must be deterministic across nodes; re-registering
//! the same pair is idempotent, a conflicting pair fails with
//! `CodecConflict`.

use std::collections::BTreeMap;
use std::sync::RwLock;

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::ResourceTypeId;

/// One serializer registration: a stable type id and the name of the codec
/// bound to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecEntry {
    pub id: ResourceTypeId,
    pub name: &'static str,
}

lazy_static! {
    static ref REGISTRY: RwLock<BTreeMap<ResourceTypeId, &'static str>> = RwLock::new(BTreeMap::new());
}

/// Register a codec bundle.
#[tracing::instrument(level = "debug", skip(entries))]
pub fn register(entries: &[CodecEntry]) -> CoordinationResult<()> {
    let mut registry = REGISTRY.write().expect("codec registry poisoned");
    for entry in entries {
        match registry.get(&entry.id) {
            Some(existing) if *existing != entry.name => {
                tracing::error!(id = entry.id, existing, name = entry.name, "conflicting codec registration");
                return Err(CoordinationError::CodecConflict(entry.id));
            }
            Some(_) => {}
            None => {
                registry.insert(entry.id, entry.name);
            }
        }
    }
    Ok(())
}

/// The codec name bound to `id`, if any.
pub fn lookup(id: ResourceTypeId) -> Option<&'static str> {
    REGISTRY.read().expect("codec registry poisoned").get(&id).copied()
}

/// Encode one payload value.
pub fn encode<T: Serialize>(value: &T) -> CoordinationResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode one payload value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoordinationResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let entries = [CodecEntry { id: 900, name: "test/a" }];
        register(&entries).unwrap();
        register(&entries).unwrap();
        assert_eq!(lookup(900), Some("test/a"));
    }

    #[test]
    fn conflicting_registration_fails() {
        register(&[CodecEntry { id: 901, name: "test/b" }]).unwrap();
        let err = register(&[CodecEntry { id: 901, name: "test/c" }]).unwrap_err();
        assert_eq!(err, CoordinationError::CodecConflict(901));
    }

    #[test]
    fn payload_round_trip() {
        let bytes = encode(&("hello", 7u64)).unwrap();
        let (s, n): (String, u64) = decode(&bytes).unwrap();
        assert_eq!(s, "hello");
        assert_eq!(n, 7);
    }
}
