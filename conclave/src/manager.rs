//! The resource manager state machine.
//!
//! One manager multiplexes every logical resource onto a single Raft log: it
//! owns the `(key, type) → id` registry, instantiates and hosts the
//! per-resource state machines, routes committed envelopes to them, tracks
//! per-session ownership, and drives the deterministic timeline that per-
//! resource timers (TTL eviction, task reassignment) hang off.
//!
//! Everything here runs on the host's single logical thread, in committed-log
//! order. Invariant violations are programmer errors and abort the replica: a
//! divergent state machine is worse than a stopped one.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::codec;
use crate::commit::Commit;
use crate::commit::CommitLedger;
use crate::config::ResourceConfig;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::machine::MachineContext;
use crate::machine::ResourceStateMachine;
use crate::machine::Timeline;
use crate::protocol::ResourceRequest;
use crate::resource::TypeRegistry;
use crate::session::SessionRegistry;
use crate::MessageSummary;
use crate::ResourceId;
use crate::ResourceTypeId;
use crate::SessionId;

/// The replicated record of one named resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub key: String,
    pub type_id: ResourceTypeId,
    pub config: ResourceConfig,
    pub owners: BTreeSet<SessionId>,
}

/// The resource manager state machine. See the module docs.
pub struct ResourceManager {
    registry: TypeRegistry,
    /// `(type, key)` is the primary key of a resource record.
    by_key: BTreeMap<(ResourceTypeId, String), ResourceId>,
    /// `id` is the alternate key.
    by_id: BTreeMap<ResourceId, ResourceRecord>,
    /// The runtime state machine instances, keyed like `by_id`.
    machines: BTreeMap<ResourceId, Box<dyn ResourceStateMachine>>,
    /// Which resources each session owns, for expiry sweeps.
    sessions: BTreeMap<SessionId, BTreeSet<ResourceId>>,
    next_id: ResourceId,
    timeline: Timeline,
    session_registry: SessionRegistry,
    ledger: CommitLedger,
}

impl ResourceManager {
    pub fn new(registry: TypeRegistry) -> Self {
        Self {
            registry,
            by_key: BTreeMap::new(),
            by_id: BTreeMap::new(),
            machines: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_id: 1,
            timeline: Timeline::new(),
            session_registry: SessionRegistry::new(),
            ledger: CommitLedger::new(),
        }
    }

    /// The commit-conservation ledger shared with every commit this manager
    /// hosts.
    pub fn ledger(&self) -> CommitLedger {
        self.ledger.clone()
    }

    /// The session registry, for the host to attach transports and apply
    /// acknowledgements.
    pub fn sessions_mut(&mut self) -> &mut SessionRegistry {
        &mut self.session_registry
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.session_registry
    }

    /// Advance the deterministic clock, firing every due timer.
    pub fn advance_time(&mut self, now: u64) {
        loop {
            let due = self.timeline.advance(now);
            if due.is_empty() {
                return;
            }
            for (resource, timer) in due {
                if let Some(machine) = self.machines.get_mut(&resource) {
                    let mut ctx = MachineContext {
                        resource,
                        now,
                        timeline: &mut self.timeline,
                        sessions: &mut self.session_registry,
                    };
                    machine.timeout(timer, &mut ctx);
                }
            }
        }
    }

    /// Apply one committed entry, in log order.
    #[tracing::instrument(level = "debug", skip(self, commit), fields(index = commit.index(), session = commit.session()))]
    pub fn apply(&mut self, commit: Commit) -> CoordinationResult<Vec<u8>> {
        self.advance_time(commit.timestamp());

        let request: ResourceRequest = match commit.decode() {
            Ok(request) => request,
            Err(err) => {
                commit.close();
                return Err(err);
            }
        };
        tracing::debug!("apply: {}", request.summary());

        match request {
            ResourceRequest::Get { key, type_id } => {
                let result = self.get_resource(&key, type_id, commit.session());
                commit.close();
                codec::encode(&result?)
            }
            ResourceRequest::GetIfExists { key, type_id } => {
                // Pure lookup: served off the log, so it must not touch
                // owner sets.
                let id = self.by_key.get(&(type_id, key)).copied();
                commit.close();
                codec::encode(&id)
            }
            ResourceRequest::Close { id } => {
                let result = self.close_resource(id, commit.session());
                commit.close();
                codec::encode(&result?)
            }
            ResourceRequest::Delete { id } => {
                let result = self.delete_resource(id);
                commit.close();
                codec::encode(&result?)
            }
            ResourceRequest::Configure { id, config } => {
                let result = self.configure_resource(id, config);
                commit.close();
                codec::encode(&result?)
            }
            ResourceRequest::Command { id, payload, .. } | ResourceRequest::Query { id, payload, .. } => {
                self.forward(id, payload, commit)
            }
        }
    }

    /// A session expired: run every owned machine's expiry hook, then drop
    /// the session from all owner sets and stop its event stream.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn session_expired(&mut self, session: SessionId) {
        self.sweep_session(session, true);
        self.session_registry.expire(session);
    }

    /// A session closed cleanly.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn session_closed(&mut self, session: SessionId) {
        self.sweep_session(session, false);
        self.session_registry.close(session);
    }

    /// A deterministic digest of the full manager state: records plus every
    /// machine's snapshot, in id order. Byte-equal across replicas that have
    /// applied the same log.
    pub fn digest(&self) -> Vec<u8> {
        let machines: BTreeMap<ResourceId, Vec<u8>> =
            self.machines.iter().map(|(&id, machine)| (id, machine.snapshot())).collect();
        let records: Vec<&ResourceRecord> = self.by_id.values().collect();
        serde_json::to_vec(&(records, machines)).expect("manager digest encoding")
    }

    /// The number of live resource records, for inspection in tests.
    pub fn resource_count(&self) -> usize {
        debug_assert_eq!(self.by_id.len(), self.by_key.len());
        debug_assert_eq!(self.by_id.len(), self.machines.len());
        self.by_id.len()
    }

    fn get_resource(&mut self, key: &str, type_id: ResourceTypeId, session: SessionId) -> CoordinationResult<ResourceId> {
        if key.is_empty() {
            return Err(CoordinationError::InvalidArgument("resource key must not be empty".into()));
        }
        if self.registry.get(type_id).is_none() {
            return Err(CoordinationError::UnknownType(type_id));
        }
        if let Some(&id) = self.by_key.get(&(type_id, key.to_string())) {
            self.add_owner(id, session);
            return Ok(id);
        }
        if let Some(record) = self.by_id.values().find(|r| r.key == key && r.type_id != type_id) {
            return Err(CoordinationError::TypeMismatch {
                key: key.to_string(),
                existing: record.type_id,
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let config = ResourceConfig::new();
        let rtype = self.registry.get(type_id).expect("type vanished after lookup");
        let machine = rtype.instantiate(&config);
        tracing::debug!(id, key, type_id, "created resource");
        self.by_key.insert((type_id, key.to_string()), id);
        self.by_id.insert(
            id,
            ResourceRecord {
                id,
                key: key.to_string(),
                type_id,
                config,
                owners: BTreeSet::new(),
            },
        );
        self.machines.insert(id, machine);
        self.add_owner(id, session);
        Ok(id)
    }

    fn add_owner(&mut self, id: ResourceId, session: SessionId) {
        let record = self.by_id.get_mut(&id).expect("owner added for unknown resource");
        record.owners.insert(session);
        self.sessions.entry(session).or_default().insert(id);
    }

    fn close_resource(&mut self, id: ResourceId, session: SessionId) -> CoordinationResult<()> {
        let record = self.by_id.get_mut(&id).ok_or(CoordinationError::NoSuchResource(id))?;
        // Resources are persistent by default: the record stays even with no
        // owners left.
        record.owners.remove(&session);
        if let Some(owned) = self.sessions.get_mut(&session) {
            owned.remove(&id);
        }
        Ok(())
    }

    fn delete_resource(&mut self, id: ResourceId) -> CoordinationResult<()> {
        let record = self.by_id.remove(&id).ok_or(CoordinationError::NoSuchResource(id))?;
        let mut machine = self.machines.remove(&id).expect("record without machine");
        let mut ctx = MachineContext {
            resource: id,
            now: self.timeline.now(),
            timeline: &mut self.timeline,
            sessions: &mut self.session_registry,
        };
        machine.delete(&mut ctx);
        self.by_key.remove(&(record.type_id, record.key.clone()));
        for session in &record.owners {
            if let Some(owned) = self.sessions.get_mut(session) {
                owned.remove(&id);
            }
        }
        tracing::debug!(id, key = %record.key, "deleted resource");
        Ok(())
    }

    fn configure_resource(&mut self, id: ResourceId, config: ResourceConfig) -> CoordinationResult<()> {
        let record = self.by_id.get_mut(&id).ok_or(CoordinationError::NoSuchResource(id))?;
        record.config = config.clone();
        let machine = self.machines.get_mut(&id).expect("record without machine");
        machine.configure(&config);
        Ok(())
    }

    fn forward(&mut self, id: ResourceId, payload: Vec<u8>, commit: Commit) -> CoordinationResult<Vec<u8>> {
        let machine = match self.machines.get_mut(&id) {
            Some(machine) => machine,
            None => {
                commit.close();
                return Err(CoordinationError::NoSuchResource(id));
            }
        };
        let now = commit.timestamp();
        let inner = commit.map_payload(payload);
        let mut ctx = MachineContext {
            resource: id,
            now,
            timeline: &mut self.timeline,
            sessions: &mut self.session_registry,
        };
        machine.apply(inner, &mut ctx)
    }

    fn sweep_session(&mut self, session: SessionId, expired: bool) {
        let owned = self.sessions.remove(&session).unwrap_or_default();
        for id in owned {
            if let Some(machine) = self.machines.get_mut(&id) {
                let mut ctx = MachineContext {
                    resource: id,
                    now: self.timeline.now(),
                    timeline: &mut self.timeline,
                    sessions: &mut self.session_registry,
                };
                if expired {
                    machine.session_expired(session, &mut ctx);
                } else {
                    machine.session_closed(session, &mut ctx);
                }
            }
            if let Some(record) = self.by_id.get_mut(&id) {
                record.owners.remove(&session);
            }
        }
    }
}
