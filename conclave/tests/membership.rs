use std::sync::Arc;

use anyhow::Result;
use conclave::client::membership::ClusterMembership;
use conclave::client::ResourceClient;
use conclave::protocol::ReadConsistency;
use conclave::protocol::WriteConsistency;
use conclave::resource;
use conclave::Config;
use locallog::LocalCluster;
use locallog::LocalConnector;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;

mod fixtures;

/// Membership glue test.
///
/// What does this test do?
///
/// - builds a config from a seed list.
/// - connects through the membership layer and runs an operation end to end
///   over the established session.
///
/// RUST_LOG=conclave,locallog,membership=debug cargo test -p conclave --test membership
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn connect_through_seed_rotation() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let config = Config::build("test".into()).seeds("10.0.0.1:7000,10.0.0.2:7000").validate()?;
    let membership = ClusterMembership::new(&config, Arc::new(LocalConnector::new(cluster)))?;
    assert_eq!(membership.address_book().len(), 2);

    let session = membership.connect().await?;
    let client = ResourceClient::open(session, resource::value_type(), "v").await?;
    assert!(client.resource_id() > 0);

    Ok(())
}

/// Consistency overrides are handle-local and never leak to other handles.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn consistency_overrides_are_handle_local() -> Result<()> {
    fixtures::init_tracing();

    let cluster = LocalCluster::new();
    let default_handle =
        ResourceClient::open(fixtures::connect(&cluster).await, resource::value_type(), "v").await?;
    let relaxed = ResourceClient::open(fixtures::connect(&cluster).await, resource::value_type(), "v")
        .await?
        .with_write_consistency(WriteConsistency::Sequential)
        .with_read_consistency(ReadConsistency::Local);

    assert_eq!(relaxed.write_consistency(), WriteConsistency::Sequential);
    assert_eq!(relaxed.read_consistency(), ReadConsistency::Local);
    assert_eq!(default_handle.write_consistency(), WriteConsistency::Atomic);
    assert_eq!(default_handle.read_consistency(), ReadConsistency::Atomic);

    // Both handles address the same replicated state.
    use conclave::machines::value::ValueOp;
    let _: () = relaxed
        .submit_command(&ValueOp::Set {
            value: conclave::codec::encode(&5u64)?,
            ttl_ms: 0,
        })
        .await?;
    let raw: Option<Vec<u8>> = default_handle.submit_query(&ValueOp::Get).await?;
    let seen: u64 = conclave::codec::decode(&raw.expect("value set through the other handle"))?;
    assert_eq!(seen, 5);

    Ok(())
}
