//! Typed gateways for the resource kinds shipped with this crate.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::client::ResourceClient;
use crate::codec;
use crate::config::ResourceConfig;
use crate::error::CoordinationError;
use crate::error::CoordinationResult;
use crate::machines::multimap::MapOp;
use crate::machines::queue::QueueOp;
use crate::machines::queue::ACK_TOPIC;
use crate::machines::queue::PROCESS_TOPIC;
use crate::machines::topic::TopicOp;
use crate::machines::topic::MESSAGE_TOPIC;
use crate::machines::value::ValueOp;
use crate::resource;
use crate::ProtocolSession;

fn encode_opt<T: Serialize>(value: Option<&T>) -> CoordinationResult<Option<Vec<u8>>> {
    value.map(|v| codec::encode(v)).transpose()
}

fn decode_opt<T: DeserializeOwned>(bytes: Option<Vec<u8>>) -> CoordinationResult<Option<T>> {
    bytes.map(|b| codec::decode(&b)).transpose()
}

fn ttl_ms(ttl: Option<Duration>) -> u64 {
    ttl.map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// A replicated value of `T`.
pub struct ValueHandle<T> {
    client: ResourceClient,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> ValueHandle<T> {
    pub async fn open(session: Arc<dyn ProtocolSession>, key: &str) -> CoordinationResult<Self> {
        let client = ResourceClient::open(session, resource::value_type(), key).await?;
        Ok(Self {
            client,
            _marker: PhantomData,
        })
    }

    pub fn client(&self) -> &ResourceClient {
        &self.client
    }

    pub async fn get(&self) -> CoordinationResult<Option<T>> {
        let raw: Option<Vec<u8>> = self.client.submit_query(&ValueOp::Get).await?;
        decode_opt(raw)
    }

    /// Replace the value. A `ttl` of `None` keeps it until overwritten.
    pub async fn set(&self, value: &T, ttl: Option<Duration>) -> CoordinationResult<()> {
        let op = ValueOp::Set {
            value: codec::encode(value)?,
            ttl_ms: ttl_ms(ttl),
        };
        self.client.submit_command(&op).await
    }

    /// Replace the value iff the current one equals `expect`. Two absent
    /// values compare equal.
    pub async fn compare_and_set(
        &self,
        expect: Option<&T>,
        update: Option<&T>,
        ttl: Option<Duration>,
    ) -> CoordinationResult<bool> {
        let op = ValueOp::CompareAndSet {
            expect: encode_opt(expect)?,
            update: encode_opt(update)?,
            ttl_ms: ttl_ms(ttl),
        };
        self.client.submit_command(&op).await
    }

    /// Replace the value, returning the previous one. `None` clears.
    pub async fn get_and_set(&self, value: Option<&T>, ttl: Option<Duration>) -> CoordinationResult<Option<T>> {
        let op = ValueOp::GetAndSet {
            value: encode_opt(value)?,
            ttl_ms: ttl_ms(ttl),
        };
        let raw: Option<Vec<u8>> = self.client.submit_command(&op).await?;
        decode_opt(raw)
    }

    pub async fn delete(self) -> CoordinationResult<()> {
        self.client.delete().await
    }

    pub async fn close(self) -> CoordinationResult<()> {
        self.client.close().await
    }
}

/// A replicated multimap from string keys to bags of `V`.
pub struct MultiMapHandle<V> {
    client: ResourceClient,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> MultiMapHandle<V> {
    pub async fn open(session: Arc<dyn ProtocolSession>, key: &str) -> CoordinationResult<Self> {
        let client = ResourceClient::open(session, resource::multimap_type(), key).await?;
        Ok(Self {
            client,
            _marker: PhantomData,
        })
    }

    pub fn client(&self) -> &ResourceClient {
        &self.client
    }

    pub async fn configure(&self, config: ResourceConfig) -> CoordinationResult<()> {
        self.client.configure(config).await
    }

    pub async fn put(&self, key: &str, value: &V) -> CoordinationResult<bool> {
        let op = MapOp::Put {
            key: key.to_string(),
            value: codec::encode(value)?,
        };
        self.client.submit_command(&op).await
    }

    pub async fn put_if_absent(&self, key: &str, value: &V) -> CoordinationResult<bool> {
        let op = MapOp::PutIfAbsent {
            key: key.to_string(),
            value: codec::encode(value)?,
        };
        self.client.submit_command(&op).await
    }

    /// Remove the key, returning its values.
    pub async fn remove(&self, key: &str) -> CoordinationResult<Vec<V>> {
        let op = MapOp::Remove { key: key.to_string() };
        let raw: Vec<Vec<u8>> = self.client.submit_command(&op).await?;
        raw.iter().map(|b| codec::decode(b)).collect()
    }

    /// Remove one occurrence of `value` under `key`.
    pub async fn remove_value(&self, key: &str, value: &V) -> CoordinationResult<bool> {
        let op = MapOp::RemoveValue {
            key: key.to_string(),
            value: codec::encode(value)?,
        };
        self.client.submit_command(&op).await
    }

    /// The key's values, in the bag's configured order.
    pub async fn get(&self, key: &str) -> CoordinationResult<Vec<V>> {
        let op = MapOp::Get { key: key.to_string() };
        let raw: Vec<Vec<u8>> = self.client.submit_query(&op).await?;
        raw.iter().map(|b| codec::decode(b)).collect()
    }

    pub async fn keys(&self) -> CoordinationResult<Vec<String>> {
        self.client.submit_query(&MapOp::Keys).await
    }

    pub async fn values(&self) -> CoordinationResult<Vec<V>> {
        let raw: Vec<Vec<u8>> = self.client.submit_query(&MapOp::Values).await?;
        raw.iter().map(|b| codec::decode(b)).collect()
    }

    pub async fn entries(&self) -> CoordinationResult<Vec<(String, V)>> {
        let raw: Vec<(String, Vec<u8>)> = self.client.submit_query(&MapOp::Entries).await?;
        raw.into_iter().map(|(k, b)| Ok((k, codec::decode(&b)?))).collect()
    }

    pub async fn size(&self) -> CoordinationResult<u64> {
        self.client.submit_query(&MapOp::Size).await
    }

    pub async fn is_empty(&self) -> CoordinationResult<bool> {
        self.client.submit_query(&MapOp::IsEmpty).await
    }

    pub async fn clear(&self) -> CoordinationResult<()> {
        self.client.submit_command(&MapOp::Clear).await
    }

    pub async fn contains_key(&self, key: &str) -> CoordinationResult<bool> {
        let op = MapOp::ContainsKey { key: key.to_string() };
        self.client.submit_query(&op).await
    }

    pub async fn contains_value(&self, value: &V) -> CoordinationResult<bool> {
        let op = MapOp::ContainsValue { value: codec::encode(value)? };
        self.client.submit_query(&op).await
    }

    pub async fn contains_entry(&self, key: &str, value: &V) -> CoordinationResult<bool> {
        let op = MapOp::ContainsEntry {
            key: key.to_string(),
            value: codec::encode(value)?,
        };
        self.client.submit_query(&op).await
    }

    pub async fn close(self) -> CoordinationResult<()> {
        self.client.close().await
    }
}

/// A pub/sub topic carrying messages of `M`.
pub struct TopicHandle<M> {
    client: ResourceClient,
    _marker: PhantomData<fn() -> M>,
}

impl<M> std::fmt::Debug for TopicHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicHandle").finish()
    }
}

impl<M: Serialize + DeserializeOwned + 'static> TopicHandle<M> {
    pub async fn open(session: Arc<dyn ProtocolSession>, key: &str) -> CoordinationResult<Self> {
        let client = ResourceClient::open(session, resource::topic_type(), key).await?;
        Ok(Self {
            client,
            _marker: PhantomData,
        })
    }

    pub fn client(&self) -> &ResourceClient {
        &self.client
    }

    /// Register a message handler. Register before `listen` so no delivery
    /// races the subscription.
    pub fn on_message(&self, handler: impl Fn(M) + Send + 'static) {
        self.client.on_event(MESSAGE_TOPIC, move |payload| match codec::decode::<M>(payload) {
            Ok(message) => handler(message),
            Err(err) => tracing::error!(error = %err, "failed to decode topic message"),
        });
    }

    /// Subscribe this session to the topic.
    pub async fn listen(&self) -> CoordinationResult<()> {
        self.client.submit_command(&TopicOp::Listen).await
    }

    /// Drop this session's subscription.
    pub async fn unlisten(&self) -> CoordinationResult<bool> {
        self.client.submit_command(&TopicOp::Unlisten).await
    }

    /// Publish to every subscriber. Returns the number of live subscribers
    /// the message was fanned out to.
    pub async fn publish(&self, message: &M) -> CoordinationResult<u64> {
        let op = TopicOp::Publish {
            message: codec::encode(message)?,
        };
        self.client.submit_command(&op).await
    }

    pub async fn close(self) -> CoordinationResult<()> {
        self.client.close().await
    }
}

/// A distributed task queue carrying payloads of `T`.
pub struct TaskQueueHandle<T> {
    client: ResourceClient,
    pending_acks: Arc<Mutex<BTreeMap<String, oneshot::Sender<()>>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned + 'static> TaskQueueHandle<T> {
    pub async fn open(session: Arc<dyn ProtocolSession>, key: &str) -> CoordinationResult<Self> {
        let client = ResourceClient::open(session, resource::task_queue_type(), key).await?;
        let pending_acks: Arc<Mutex<BTreeMap<String, oneshot::Sender<()>>>> = Arc::new(Mutex::new(BTreeMap::new()));

        let acks = pending_acks.clone();
        client.on_event(ACK_TOPIC, move |payload| match codec::decode::<String>(payload) {
            Ok(task_id) => {
                let waiter = acks.lock().expect("pending acks poisoned").remove(&task_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => tracing::debug!(%task_id, "ack for unknown or already-completed task"),
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to decode task ack"),
        });

        Ok(Self {
            client,
            pending_acks,
            _marker: PhantomData,
        })
    }

    pub fn client(&self) -> &ResourceClient {
        &self.client
    }

    /// Register the worker callback invoked with `(task_id, payload)` for
    /// every task assigned to this session. Call `ack` once processing is
    /// done; an unacknowledged task is redelivered to another consumer if
    /// this session dies.
    pub fn on_process(&self, worker: impl Fn(String, T) + Send + 'static) {
        self.client.on_event(PROCESS_TOPIC, move |payload| {
            match codec::decode::<(String, Vec<u8>)>(payload) {
                Ok((task_id, raw)) => match codec::decode::<T>(&raw) {
                    Ok(task) => worker(task_id, task),
                    Err(err) => tracing::error!(%task_id, error = %err, "failed to decode task payload"),
                },
                Err(err) => tracing::error!(error = %err, "failed to decode task envelope"),
            }
        });
    }

    /// Join the consumer ring.
    pub async fn subscribe(&self) -> CoordinationResult<()> {
        self.client.submit_command(&QueueOp::Subscribe).await
    }

    /// Leave the consumer ring. An in-flight task is requeued.
    pub async fn unsubscribe(&self) -> CoordinationResult<()> {
        self.client.submit_command(&QueueOp::Unsubscribe).await
    }

    /// Enqueue a task, fire-and-forget.
    pub async fn submit(&self, task_id: &str, task: &T) -> CoordinationResult<()> {
        let op = QueueOp::Submit {
            task_id: task_id.to_string(),
            payload: codec::encode(task)?,
            ack: false,
        };
        self.client.submit_command(&op).await
    }

    /// Enqueue a task and wait until some consumer has processed and
    /// acknowledged it.
    pub async fn submit_sync(&self, task_id: &str, task: &T) -> CoordinationResult<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().expect("pending acks poisoned").insert(task_id.to_string(), tx);

        let op = QueueOp::Submit {
            task_id: task_id.to_string(),
            payload: codec::encode(task)?,
            ack: true,
        };
        if let Err(err) = self.client.submit_command::<_, ()>(&op).await {
            self.pending_acks.lock().expect("pending acks poisoned").remove(task_id);
            return Err(err);
        }

        rx.await.map_err(|_| CoordinationError::IllegalState("task queue handle dropped".into()))
    }

    /// Acknowledge this session's in-flight task. Returns false when there
    /// was none.
    pub async fn ack(&self) -> CoordinationResult<bool> {
        self.client.submit_command(&QueueOp::Ack).await
    }

    pub async fn close(self) -> CoordinationResult<()> {
        self.client.close().await
    }
}
