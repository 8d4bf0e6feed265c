//! Retry policies for coordination and RPC.
//!
//! All policies use the `backon` crate with jitter.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `rpc_policy` | configured | 2s | configured | `call_with_retry` |
//! | `backend_policy` | 50ms | 5s | 10 | Register/unregister with the backend |
//!
//! Only the errors the caller's condition accepts are retried; everything
//! else is returned after the first attempt.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::constants::MAX_RPC_RETRY_DELAY;

/// Policy for node-to-node RPC calls.
///
/// `max_retries` counts retries after the first attempt, so a call makes at
/// most `max_retries + 1` attempts.
pub fn rpc_policy(min_delay: Duration, max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(MAX_RPC_RETRY_DELAY.max(min_delay))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Policy for leadership backend writes (register, unregister).
///
/// Moderate initial delay and many retries to ride out backend leader changes.
pub fn backend_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Execute an async operation with the backend retry policy.
///
/// ```rust,ignore
/// retry::with_backend_policy(
///     || async { backend.register(&node).await },
///     |e| e.is_retriable(),
/// ).await?;
/// ```
pub async fn with_backend_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation.retry(backend_policy()).when(condition).await
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: usize) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a success that needed at least one retry.
pub fn record_retry_success(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}
