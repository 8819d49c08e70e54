//! The client-side resource gateway.

pub mod handles;
pub mod membership;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::codec;
use crate::config::ResourceConfig;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::protocol::ReadConsistency;
use crate::protocol::ResourceRequest;
use crate::protocol::WriteConsistency;
use crate::resource::ResourceType;
use crate::ClientState;
use crate::ProtocolSession;
use crate::ResourceId;

pub use handles::MultiMapHandle;
pub use handles::TaskQueueHandle;
pub use handles::TopicHandle;
pub use handles::ValueHandle;

type Handler = Box<dyn Fn(&[u8]) + Send + 'static>;

#[derive(Default)]
struct HandlerTable {
    by_topic: BTreeMap<String, Vec<Handler>>,
}

/// A typed handle over one resource, bound to one Raft client session.
///
/// The gateway wraps the session into the operation envelope protocol:
/// commands and queries are submitted at the handle's configured write/read
/// consistency, and server-initiated events for the resource are routed to
/// per-topic handler callbacks on a dedicated dispatch task.
///
/// Consistency defaults are handle-local: `with_write_consistency` /
/// `with_read_consistency` never affect other handles of the same resource.
pub struct ResourceClient {
    session: Arc<dyn ProtocolSession>,
    rtype: ResourceType,
    key: String,
    resource_id: ResourceId,
    write_consistency: WriteConsistency,
    read_consistency: ReadConsistency,
    request_timeout: Duration,
    handlers: Arc<Mutex<HandlerTable>>,
    closed: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl ResourceClient {
    /// Open a gateway for `(key, type)`, creating the resource on first use.
    ///
    /// Registers the type's codec bundle with the process-wide serializer
    /// (idempotent), resolves the resource id through the manager, and spawns
    /// the event dispatch task for this handle.
    #[tracing::instrument(level = "debug", skip(session, rtype), fields(rtype = rtype.name))]
    pub async fn open(
        session: Arc<dyn ProtocolSession>,
        rtype: ResourceType,
        key: &str,
    ) -> CoordinationResult<ResourceClient> {
        if key.is_empty() {
            return Err(CoordinationError::InvalidArgument("resource key must not be empty".into()));
        }
        if rtype.id == 0 {
            return Err(CoordinationError::InvalidArgument("resource type id must be non-zero".into()));
        }
        codec::register(rtype.codec)?;

        let request = ResourceRequest::Get {
            key: key.to_string(),
            type_id: rtype.id,
        };
        let resource_id: ResourceId = codec::decode(&session.submit(request).await?)?;

        let handlers = Arc::new(Mutex::new(HandlerTable::default()));
        let closed = Arc::new(AtomicBool::new(false));
        let dispatcher = spawn_dispatcher(session.clone(), resource_id, handlers.clone(), closed.clone());

        Ok(ResourceClient {
            session,
            rtype,
            key: key.to_string(),
            resource_id,
            write_consistency: WriteConsistency::Atomic,
            read_consistency: ReadConsistency::Atomic,
            request_timeout: Duration::from_millis(5_000),
            handlers,
            closed,
            dispatcher,
        })
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.rtype
    }

    pub fn write_consistency(&self) -> WriteConsistency {
        self.write_consistency
    }

    pub fn read_consistency(&self) -> ReadConsistency {
        self.read_consistency
    }

    /// Set this handle's default consistency for commands.
    pub fn with_write_consistency(mut self, consistency: WriteConsistency) -> Self {
        self.write_consistency = consistency;
        self
    }

    /// Set this handle's default consistency for queries.
    pub fn with_read_consistency(mut self, consistency: ReadConsistency) -> Self {
        self.read_consistency = consistency;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Watch the session's connection state. `Connected` operations whose
    /// futures also complete while `Connected` are linearizable; anything
    /// weaker is flagged by a `Suspended` interval.
    pub fn states(&self) -> watch::Receiver<ClientState> {
        self.session.states()
    }

    /// Invoke `callback` on every state transition, on a spawned task.
    pub fn on_state_change(&self, callback: impl Fn(ClientState) + Send + 'static) {
        let mut states = self.session.states();
        tokio::spawn(
            async move {
                while states.changed().await.is_ok() {
                    callback(*states.borrow());
                }
            }
            .instrument(tracing::debug_span!("state-watch")),
        );
    }

    /// Register a handler for events published under `topic`.
    pub fn on_event(&self, topic: &str, handler: impl Fn(&[u8]) + Send + 'static) {
        let mut table = self.handlers.lock().expect("handler table poisoned");
        table.by_topic.entry(topic.to_string()).or_default().push(Box::new(handler));
    }

    /// Submit a command at this handle's write consistency.
    pub async fn submit_command<C, R>(&self, op: &C) -> CoordinationResult<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let request = ResourceRequest::Command {
            id: self.resource_id,
            consistency: self.write_consistency,
            payload: codec::encode(op)?,
        };
        codec::decode(&self.submit(request).await?)
    }

    /// Submit a query at this handle's read consistency.
    pub async fn submit_query<Q, R>(&self, op: &Q) -> CoordinationResult<R>
    where
        Q: Serialize,
        R: DeserializeOwned,
    {
        let request = ResourceRequest::Query {
            id: self.resource_id,
            consistency: self.read_consistency,
            payload: codec::encode(op)?,
        };
        codec::decode(&self.submit(request).await?)
    }

    /// Replace the resource's replicated configuration.
    pub async fn configure(&self, config: ResourceConfig) -> CoordinationResult<()> {
        let request = ResourceRequest::Configure {
            id: self.resource_id,
            config,
        };
        codec::decode(&self.submit(request).await?)
    }

    /// Delete the resource cluster-wide. The handle is unusable afterwards.
    pub async fn delete(self) -> CoordinationResult<()> {
        let request = ResourceRequest::Delete { id: self.resource_id };
        let result = self.submit(request).await;
        self.closed.store(true, Ordering::SeqCst);
        self.dispatcher.abort();
        codec::decode(&result?)
    }

    /// Drop this session's ownership of the resource, keeping the session
    /// alive. The resource itself persists even with no owners left.
    pub async fn release(self) -> CoordinationResult<()> {
        let request = ResourceRequest::Close { id: self.resource_id };
        let result = self.submit(request).await;
        self.closed.store(true, Ordering::SeqCst);
        self.dispatcher.abort();
        result.map(|_| ())
    }

    /// Close the underlying session. The manager's session-close sweep runs
    /// every owned resource's close hook (dropping subscriptions, requeueing
    /// in-flight tasks) before ownership is released.
    pub async fn close(self) -> CoordinationResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.dispatcher.abort();
        self.session.close().await
    }

    async fn submit(&self, request: ResourceRequest) -> CoordinationResult<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::IllegalState("resource handle is closed".into()));
        }
        match tokio::time::timeout(self.request_timeout, self.session.submit(request)).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Timeout(self.request_timeout.as_millis() as u64)),
        }
    }
}

/// Route the session's event stream into this handle's per-topic handlers.
///
/// Events arrive in sequence order; each one is acknowledged after the
/// handlers ran. A handler failure is the application's problem: it is
/// logged and never blocks acknowledgement.
fn spawn_dispatcher(
    session: Arc<dyn ProtocolSession>,
    resource_id: ResourceId,
    handlers: Arc<Mutex<HandlerTable>>,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let mut events = session.events();
    tokio::spawn(
        async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "event dispatcher lagged; events redelivered on reconnect");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                if event.resource != resource_id {
                    continue;
                }
                {
                    let table = handlers.lock().expect("handler table poisoned");
                    if let Some(list) = table.by_topic.get(&event.topic) {
                        for handler in list {
                            handler(&event.payload);
                        }
                    }
                }
                if let Err(err) = session.acknowledge(resource_id, event.seq).await {
                    tracing::debug!(seq = event.seq, error = %err, "event acknowledgement failed");
                }
            }
        }
        .instrument(tracing::debug_span!("event-dispatch", resource = resource_id)),
    )
}
