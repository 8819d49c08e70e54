use anyhow::Result;
use conclave::client::MultiMapHandle;
use conclave::config::ResourceConfig;
use conclave::config::ValueOrder;
use locallog::LocalCluster;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;

mod fixtures;

/// MultiMap natural-order test.
///
/// What does this test do?
///
/// - configure a multimap for natural value ordering.
/// - put "foo" then "bar" under one key.
/// - asserts reads come back sorted regardless of insertion order, and that
///   clear leaves an empty map.
///
/// RUST_LOG=conclave,locallog,multimap_order=debug cargo test -p conclave --test multimap_order
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn natural_value_order() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let map: MultiMapHandle<String> = MultiMapHandle::open(session, "m").await?;
    map.configure(ResourceConfig::new().with_value_order(ValueOrder::Natural)).await?;

    map.put("foo", &"foo".to_string()).await?;
    map.put("foo", &"bar".to_string()).await?;

    assert_eq!(map.get("foo").await?, vec!["bar".to_string(), "foo".to_string()]);
    assert_eq!(map.size().await?, 2);

    map.clear().await?;
    assert_eq!(map.size().await?, 0);
    assert!(map.is_empty().await?);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn insertion_order_preserves_duplicates() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let map: MultiMapHandle<String> = MultiMapHandle::open(session, "m").await?;

    map.put("k", &"b".to_string()).await?;
    map.put("k", &"a".to_string()).await?;
    map.put("k", &"b".to_string()).await?;

    assert_eq!(map.get("k").await?, vec!["b".to_string(), "a".to_string(), "b".to_string()]);

    assert!(map.remove_value("k", &"b".to_string()).await?);
    assert_eq!(map.get("k").await?, vec!["a".to_string(), "b".to_string()]);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn dedup_rejects_duplicate_values() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let map: MultiMapHandle<String> = MultiMapHandle::open(session, "dedup").await?;
    map.configure(ResourceConfig::new().with_value_order(ValueOrder::Dedup)).await?;

    assert!(map.put("k", &"x".to_string()).await?);
    assert!(!map.put("k", &"x".to_string()).await?);
    assert_eq!(map.size().await?, 1);

    Ok(())
}

/// No key ever maps to an empty value bag.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn empty_bags_are_deleted() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let map: MultiMapHandle<String> = MultiMapHandle::open(session, "bags").await?;

    map.put("k", &"only".to_string()).await?;
    assert!(map.contains_entry("k", &"only".to_string()).await?);

    assert!(map.remove_value("k", &"only".to_string()).await?);
    assert!(!map.contains_key("k").await?);
    assert!(map.keys().await?.is_empty());

    map.put("gone", &"v".to_string()).await?;
    assert_eq!(map.remove("gone").await?, vec!["v".to_string()]);
    assert!(!map.contains_key("gone").await?);
    assert!(map.is_empty().await?);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn read_surface_is_consistent() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let session = fixtures::connect(&cluster).await;
    let map: MultiMapHandle<u64> = MultiMapHandle::open(session, "reads").await?;

    assert!(map.put_if_absent("a", &1).await?);
    assert!(!map.put_if_absent("a", &2).await?);
    map.put("b", &3).await?;

    assert_eq!(map.keys().await?, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(map.values().await?, vec![1, 3]);
    assert_eq!(map.entries().await?, vec![("a".to_string(), 1), ("b".to_string(), 3)]);
    assert!(map.contains_key("a").await?);
    assert!(map.contains_value(&3).await?);
    assert!(!map.contains_entry("a", &3).await?);

    Ok(())
}
