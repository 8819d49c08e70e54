use std::time::Duration;

use anyhow::Result;
use conclave::client::ValueHandle;
use locallog::LocalCluster;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;

mod fixtures;

/// Value TTL eviction test.
///
/// What does this test do?
///
/// - set `x = 42` with a 200ms TTL.
/// - before the deadline the value is readable.
/// - after the clock passes the deadline the value is gone and the value
///   machine retains no open commit.
///
/// RUST_LOG=conclave,locallog,value_ttl=debug cargo test -p conclave --test value_ttl
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn value_ttl_eviction() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let value: ValueHandle<u64> = ValueHandle::open(session, "x").await?;

    value.set(&42, Some(Duration::from_millis(200))).await?;
    assert_eq!(value.get().await?, Some(42));
    assert_eq!(cluster.ledger().open_commits(), 1, "the set commit owns the payload");

    tracing::info!("--- advancing the clock past the TTL deadline");
    cluster.advance_clock(250).await;

    assert_eq!(value.get().await?, None);
    assert_eq!(cluster.ledger().open_commits(), 0, "eviction must close the owner commit");
    assert_eq!(cluster.ledger().leaked(), 0);

    Ok(())
}

/// A newer set supersedes the pending eviction entirely.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn overwrite_cancels_pending_eviction() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let value: ValueHandle<String> = ValueHandle::open(session, "x").await?;

    value.set(&"short-lived".to_string(), Some(Duration::from_millis(100))).await?;
    value.set(&"durable".to_string(), None).await?;

    cluster.advance_clock(500).await;

    assert_eq!(value.get().await?, Some("durable".to_string()));
    assert_eq!(cluster.ledger().open_commits(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn compare_and_set_uses_deep_equality() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let value: ValueHandle<String> = ValueHandle::open(session, "cas").await?;

    // Both sides absent compare equal.
    assert!(value.compare_and_set(None, Some(&"a".to_string()), None).await?);
    assert_eq!(value.get().await?, Some("a".to_string()));

    assert!(!value.compare_and_set(Some(&"b".to_string()), Some(&"c".to_string()), None).await?);
    assert_eq!(value.get().await?, Some("a".to_string()));

    assert!(value.compare_and_set(Some(&"a".to_string()), None, None).await?);
    assert_eq!(value.get().await?, None);
    assert_eq!(cluster.ledger().open_commits(), 0, "a cleared value retains no commit");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn get_and_set_returns_previous() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let value: ValueHandle<u64> = ValueHandle::open(session, "swap").await?;

    assert_eq!(value.get_and_set(Some(&1), None).await?, None);
    assert_eq!(value.get_and_set(Some(&2), None).await?, Some(1));
    assert_eq!(value.get_and_set(None, None).await?, Some(2));
    assert_eq!(value.get().await?, None);

    Ok(())
}
