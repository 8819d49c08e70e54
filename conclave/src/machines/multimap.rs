//! A replicated multimap with configurable value-bag ordering.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::commit::Commit;
use crate::config::ResourceConfig;
use crate::config::ValueOrder;
use crate::error::CoordinationResult;
use crate::machine::MachineContext;
use crate::machine::ResourceStateMachine;

/// Operations on a replicated multimap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MapOp {
    Put { key: String, value: Vec<u8> },
    PutIfAbsent { key: String, value: Vec<u8> },
    Remove { key: String },
    RemoveValue { key: String, value: Vec<u8> },
    Get { key: String },
    Keys,
    Values,
    Entries,
    Size,
    IsEmpty,
    Clear,
    ContainsKey { key: String },
    ContainsValue { value: Vec<u8> },
    ContainsEntry { key: String, value: Vec<u8> },
}

/// One key's values, ordered per the resource's configured policy.
///
/// Iteration order is pinned explicitly (an insertion list, or sorted on
/// insert for natural order) so it never depends on hash-table layout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct ValueBag {
    items: Vec<Vec<u8>>,
}

impl ValueBag {
    fn insert(&mut self, value: Vec<u8>, order: ValueOrder) -> bool {
        match order {
            ValueOrder::Insertion => {
                self.items.push(value);
                true
            }
            ValueOrder::Natural => {
                let at = self.items.binary_search(&value).unwrap_or_else(|at| at);
                self.items.insert(at, value);
                true
            }
            ValueOrder::Dedup => {
                if self.items.contains(&value) {
                    false
                } else {
                    self.items.push(value);
                    true
                }
            }
        }
    }

    fn remove(&mut self, value: &[u8]) -> bool {
        match self.items.iter().position(|v| v == value) {
            Some(at) => {
                self.items.remove(at);
                true
            }
            None => false,
        }
    }
}

/// State machine for a replicated multimap.
///
/// Empty bags are deleted eagerly: no key ever maps to an empty value bag.
#[derive(Default)]
pub struct MultiMapMachine {
    map: BTreeMap<String, ValueBag>,
    order: ValueOrder,
}

impl MultiMapMachine {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            map: BTreeMap::new(),
            order: config.value_order(),
        }
    }

    fn put(&mut self, key: String, value: Vec<u8>) -> bool {
        let order = self.order;
        self.map.entry(key).or_default().insert(value, order)
    }

    fn size(&self) -> u64 {
        self.map.values().map(|bag| bag.items.len() as u64).sum()
    }
}

impl ResourceStateMachine for MultiMapMachine {
    fn apply(&mut self, commit: Commit, _ctx: &mut MachineContext<'_>) -> CoordinationResult<Vec<u8>> {
        let op = match commit.decode::<MapOp>() {
            Ok(op) => op,
            Err(err) => {
                commit.close();
                return Err(err);
            }
        };
        let response = match op {
            MapOp::Put { key, value } => codec::encode(&self.put(key, value)),
            MapOp::PutIfAbsent { key, value } => {
                let added = if self.map.contains_key(&key) { false } else { self.put(key, value) };
                codec::encode(&added)
            }
            MapOp::Remove { key } => {
                let removed = self.map.remove(&key).map(|bag| bag.items).unwrap_or_default();
                codec::encode(&removed)
            }
            MapOp::RemoveValue { key, value } => {
                let removed = match self.map.get_mut(&key) {
                    Some(bag) => bag.remove(&value),
                    None => false,
                };
                if matches!(self.map.get(&key), Some(bag) if bag.items.is_empty()) {
                    self.map.remove(&key);
                }
                codec::encode(&removed)
            }
            MapOp::Get { key } => {
                let values = self.map.get(&key).map(|bag| bag.items.clone()).unwrap_or_default();
                codec::encode(&values)
            }
            MapOp::Keys => codec::encode(&self.map.keys().collect::<Vec<_>>()),
            MapOp::Values => {
                let values: Vec<&Vec<u8>> = self.map.values().flat_map(|bag| bag.items.iter()).collect();
                codec::encode(&values)
            }
            MapOp::Entries => {
                let entries: Vec<(&String, &Vec<u8>)> =
                    self.map.iter().flat_map(|(k, bag)| bag.items.iter().map(move |v| (k, v))).collect();
                codec::encode(&entries)
            }
            MapOp::Size => codec::encode(&self.size()),
            MapOp::IsEmpty => codec::encode(&self.map.is_empty()),
            MapOp::Clear => {
                self.map.clear();
                codec::encode(&())
            }
            MapOp::ContainsKey { key } => codec::encode(&self.map.contains_key(&key)),
            MapOp::ContainsValue { value } => {
                let found = self.map.values().any(|bag| bag.items.contains(&value));
                codec::encode(&found)
            }
            MapOp::ContainsEntry { key, value } => {
                let found = matches!(self.map.get(&key), Some(bag) if bag.items.contains(&value));
                codec::encode(&found)
            }
        };
        commit.close();
        response
    }

    fn configure(&mut self, config: &ResourceConfig) {
        self.order = config.value_order();
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&(&self.map, &self.order)).expect("multimap snapshot encoding")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_order_sorts_on_insert() {
        let mut bag = ValueBag::default();
        bag.insert(b"foo".to_vec(), ValueOrder::Natural);
        bag.insert(b"bar".to_vec(), ValueOrder::Natural);
        bag.insert(b"baz".to_vec(), ValueOrder::Natural);
        assert_eq!(bag.items, vec![b"bar".to_vec(), b"baz".to_vec(), b"foo".to_vec()]);
    }

    #[test]
    fn dedup_rejects_duplicates() {
        let mut bag = ValueBag::default();
        assert!(bag.insert(b"x".to_vec(), ValueOrder::Dedup));
        assert!(!bag.insert(b"x".to_vec(), ValueOrder::Dedup));
        assert_eq!(bag.items.len(), 1);
    }

    #[test]
    fn insertion_order_keeps_duplicates() {
        let mut bag = ValueBag::default();
        bag.insert(b"x".to_vec(), ValueOrder::Insertion);
        bag.insert(b"x".to_vec(), ValueOrder::Insertion);
        assert_eq!(bag.items.len(), 2);
    }
}
