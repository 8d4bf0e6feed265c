//! Two-node leadership demo over the in-memory backend.
//!
//! Starts a node configured from the environment plus a second peer, both
//! hosting the same partitions, then hands leadership over and prints what
//! each node sees.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example node --features test-utilities
//! ```
//!
//! With JSON logging and custom partitions:
//! ```bash
//! LOG_FORMAT=json HOSTED_PARTITIONS="orders:0,orders:1" \
//!   cargo run --example node --features test-utilities
//! ```
//!
//! Prometheus metrics collected during the run are printed at the end.

use std::sync::Arc;

use partcoord::cluster::metrics::encode_metrics;
use partcoord::prelude::*;
use partcoord::rpc::NodeRpcClient;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let mut config = CoordinatorConfig::from_env()?;
    if config.hosted_partitions.is_empty() {
        config.hosted_partitions = vec![("orders".to_string(), 0), ("orders".to_string(), 1)];
    }
    let partitions = config.hosted_partitions.clone();

    let backend = InMemoryLeadership::new();
    let first = NodeCoordinator::new(config.clone(), Arc::new(backend.clone()));
    let second = NodeCoordinator::new(
        CoordinatorConfig {
            rpc_port: 0,
            extra_id: "peer".to_string(),
            ..config
        },
        Arc::new(backend.clone()),
    );

    first.start().await?;
    second.start().await?;

    let first_addr = first.rpc_addr().await.unwrap_or_default();
    let client = NodeRpcClient::connect(&first_addr, first.config().rpc_timeout).await?;
    let (echo, envelope) = client.call_rpc_test("hello").await;
    info!(addr = %first_addr, echo = %echo, envelope = ?envelope, "Echo from first node");

    for (topic, partition) in &partitions {
        first.release_partition(topic, *partition).await?;
        second.try_acquire_partition(topic, *partition).await?;

        let seen_by_first = first.leader_session(topic, *partition).await;
        info!(
            topic = %topic,
            partition,
            session = ?seen_by_first.map(|s| s.session),
            "First node sees new leader"
        );
    }

    second.stop().await?;
    first.stop().await?;

    println!("{}", encode_metrics()?);
    Ok(())
}
