use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use conclave::client::TaskQueueHandle;
use conclave::ProtocolSession;
use locallog::LocalCluster;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;

mod fixtures;

type TaskLog = Arc<Mutex<Vec<(String, String)>>>;

async fn consumer(cluster: &LocalCluster, key: &str) -> Result<(TaskQueueHandle<String>, TaskLog)> {
    let queue: TaskQueueHandle<String> = TaskQueueHandle::open(fixtures::connect(cluster).await, key).await?;
    let log: TaskLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    queue.on_process(move |task_id, payload| sink.lock().unwrap().push((task_id, payload)));
    queue.subscribe().await?;
    Ok((queue, log))
}

/// TaskQueue redelivery test.
///
/// What does this test do?
///
/// - consumer C1 subscribes and receives a synchronously submitted task.
/// - C1's session expires before it acknowledges.
/// - consumer C2 subscribes, receives the same task, and acknowledges it.
/// - the submitter's future completes, driven by exactly one ack event.
///
/// RUST_LOG=conclave,locallog,queue_redelivery=debug cargo test -p conclave --test queue_redelivery
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redelivery_after_consumer_expiry() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();

    let submitter: TaskQueueHandle<String> = TaskQueueHandle::open(fixtures::connect(&cluster).await, "q").await?;

    let c1_session = cluster.open_session().await;
    let c1_id = c1_session.id();
    let c1: TaskQueueHandle<String> = TaskQueueHandle::open(c1_session, "q").await?;
    let c1_log: TaskLog = Arc::new(Mutex::new(Vec::new()));
    let sink = c1_log.clone();
    c1.on_process(move |task_id, payload| sink.lock().unwrap().push((task_id, payload)));
    c1.subscribe().await?;

    tracing::info!("--- submitting t1 synchronously");
    let submit = tokio::spawn(async move { submitter.submit_sync("t1", &"pay attention".to_string()).await });

    let log = c1_log.clone();
    fixtures::wait_until("c1 to receive t1", move || log.lock().unwrap().len() == 1).await?;
    assert_eq!(c1_log.lock().unwrap()[0].0, "t1");
    assert!(!submit.is_finished(), "the submit future must wait for the ack");

    tracing::info!("--- expiring c1 before it acks");
    cluster.expire_session(c1_id).await?;

    tracing::info!("--- c2 subscribes and picks up the requeued task");
    let (c2, c2_log) = consumer(&cluster, "q").await?;

    let log = c2_log.clone();
    fixtures::wait_until("c2 to receive the requeued t1", move || log.lock().unwrap().len() == 1).await?;
    assert_eq!(c2_log.lock().unwrap()[0], ("t1".to_string(), "pay attention".to_string()));

    assert!(c2.ack().await?);
    submit.await??;

    assert_eq!(cluster.ledger().open_commits(), 0, "the ack waiter commit must be closed");
    assert_eq!(cluster.ledger().leaked(), 0);

    Ok(())
}

/// Tasks submitted with no consumer pend until one subscribes.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn pending_tasks_drain_to_new_consumer() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let submitter: TaskQueueHandle<String> = TaskQueueHandle::open(fixtures::connect(&cluster).await, "q").await?;

    submitter.submit("a", &"1".to_string()).await?;
    submitter.submit("b", &"2".to_string()).await?;

    let (worker, log) = consumer(&cluster, "q").await?;

    // One task in flight at a time: the second dispatch waits for the ack.
    let first = log.clone();
    fixtures::wait_until("the first task to arrive", move || first.lock().unwrap().len() == 1).await?;
    assert_eq!(log.lock().unwrap()[0], ("a".to_string(), "1".to_string()));

    assert!(worker.ack().await?);
    let second = log.clone();
    fixtures::wait_until("the second task to arrive", move || second.lock().unwrap().len() == 2).await?;
    assert_eq!(log.lock().unwrap()[1], ("b".to_string(), "2".to_string()));
    assert!(worker.ack().await?);

    assert!(!worker.ack().await?, "no in-flight task left to ack");

    Ok(())
}

/// Unsubscribing requeues the in-flight task for the remaining consumers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsubscribe_requeues_in_flight() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let submitter: TaskQueueHandle<String> = TaskQueueHandle::open(fixtures::connect(&cluster).await, "q").await?;

    let (first, first_log) = consumer(&cluster, "q").await?;
    submitter.submit("t", &"work".to_string()).await?;

    let log = first_log.clone();
    fixtures::wait_until("the first consumer to receive t", move || log.lock().unwrap().len() == 1).await?;

    first.unsubscribe().await?;

    let (_second, second_log) = consumer(&cluster, "q").await?;
    let log = second_log.clone();
    fixtures::wait_until("the second consumer to receive t", move || log.lock().unwrap().len() == 1).await?;
    assert_eq!(second_log.lock().unwrap()[0], ("t".to_string(), "work".to_string()));

    Ok(())
}
