//! Fixtures for testing conclave resources against an in-memory cluster.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use conclave::ProtocolSession;
use locallog::LocalCluster;
use tracing_subscriber::prelude::*;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    // Tests in one binary share the global dispatcher; only the first call wins.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Open a session against the cluster, erased to the protocol seam the
/// gateways consume.
pub async fn connect(cluster: &LocalCluster) -> Arc<dyn ProtocolSession> {
    cluster.open_session().await
}

/// Await `condition`, polling until it holds or the fixture timeout lapses.
///
/// Event delivery crosses spawned dispatch tasks, so tests observe handler
/// side effects with a bounded wait instead of a bare sleep.
pub async fn wait_until(msg: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..400 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Err(anyhow!("timed out waiting for {}", msg))
}
