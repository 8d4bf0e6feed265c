//! Prometheus metrics for partition coordination.
//!
//! Metrics cover:
//! - RPC calls per method and outcome
//! - Retry attempts per policy and outcome
//! - Leadership acquisitions, releases and fencing rejections
//! - Cluster-leader watch events
//! - Current leader epoch per partition
//!
//! All metrics live in a custom registry with the "partcoord" prefix.
//! Registration errors fall back to an unregistered metric instead of panicking.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for coordination metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("partcoord".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_safe(
                $metric_name,
                IntCounterVec::new(opts!($metric_name, $help), &[$($label),+])
                    .expect("metric opts should be valid"),
            )
        });
    };
}

define_counter_vec!(
    RPC_CALLS,
    "rpc_calls_total",
    "RPC calls by method and outcome",
    ["method", "outcome"]
);

define_counter_vec!(
    RPC_SERVED,
    "rpc_served_total",
    "Inbound RPC requests by method and outcome",
    ["method", "outcome"]
);

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

define_counter_vec!(
    LEADER_ACQUISITIONS,
    "leader_acquisitions_total",
    "Partition leadership acquisition attempts by outcome",
    ["outcome"]
);

define_counter_vec!(
    SESSION_PROPAGATIONS,
    "session_propagations_total",
    "Leader session propagation to ISR peers by outcome",
    ["outcome"]
);

define_counter_vec!(
    FENCING_REJECTIONS,
    "fencing_rejections_total",
    "Leader sessions rejected by epoch/session fencing",
    ["reason"]
);

/// Releases of partition leadership.
pub static LEADER_RELEASES: Lazy<IntCounter> = Lazy::new(|| {
    register_safe(
        "leader_releases_total",
        IntCounter::new("leader_releases_total", "Partition leadership releases")
            .expect("metric name/help should be valid"),
    )
});

/// Cluster-leader change notifications received.
pub static WATCH_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_safe(
        "watch_events_total",
        IntCounter::new("watch_events_total", "Cluster-leader change notifications received")
            .expect("metric name/help should be valid"),
    )
});

/// Current leader epoch as seen by this node.
pub static LEADER_EPOCH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_safe(
        "leader_epoch",
        IntGaugeVec::new(
            opts!("leader_epoch", "Current leader epoch per partition"),
            &["topic", "partition"],
        )
        .expect("metric opts should be valid"),
    )
});

/// RPC client latency in seconds.
pub static RPC_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("rpc_duration_seconds", "RPC client latency including retries")
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]);
    register_safe(
        "rpc_duration_seconds",
        HistogramVec::new(opts, &["method"]).expect("metric opts should be valid"),
    )
});

/// Register `metric` with [`REGISTRY`], keeping it unregistered on failure.
fn register_safe<M>(name: &str, metric: M) -> M
where
    M: Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        warn!(name, error = %e, "Failed to register metric, using unregistered fallback");
    }
    metric
}

/// Encode all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record the outcome of an outbound RPC.
pub fn record_rpc_call(method: &str, outcome: &str, duration_secs: f64) {
    RPC_CALLS.with_label_values(&[method, outcome]).inc();
    RPC_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record the leader epoch this node currently sees for a partition.
pub fn record_leader_epoch(topic: &str, partition: i32, epoch: u64) {
    let partition = partition.to_string();
    LEADER_EPOCH
        .with_label_values(&[topic, partition.as_str()])
        .set(epoch as i64);
}
