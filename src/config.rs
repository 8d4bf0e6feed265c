//! Node coordinator configuration.
//!
//! Built from [`Default`] in tests and from environment variables in
//! deployments:
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `COORD_ADDRESS` | `node_address` | `127.0.0.1` |
//! | `COORD_RPC_PORT` | `rpc_port` | `0` (ephemeral) |
//! | `COORD_EXTRA_ID` | `extra_id` | empty |
//! | `CLUSTER_ID` | `cluster_id` | `partcoord-cluster` |
//! | `RPC_TIMEOUT_MS` | `rpc_timeout` | 3000 |
//! | `RPC_MAX_RETRIES` | `rpc_max_retries` | 3 |
//! | `RPC_RETRY_DELAY_MS` | `rpc_retry_delay` | 100 |
//! | `WATCH_KEY` | `watch_key` | `cluster-leader` |
//! | `HOSTED_PARTITIONS` | `hosted_partitions` | none, `topic:0,topic:1` |

use std::time::Duration;

use crate::constants::{
    DEFAULT_CLUSTER_ID, DEFAULT_NODE_ADDRESS, DEFAULT_RPC_MAX_RETRIES, DEFAULT_RPC_RETRY_DELAY,
    DEFAULT_RPC_TIMEOUT, DEFAULT_WATCH_KEY, MAX_RPC_RETRY_DELAY,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Address peers use to reach this node; the RPC server binds to it.
    pub node_address: String,
    /// RPC listen port. 0 picks a free port at start.
    pub rpc_port: u16,
    /// Disambiguates several nodes sharing an address and port over time.
    pub extra_id: String,
    pub cluster_id: String,
    /// Bound on connecting and on each RPC attempt.
    pub rpc_timeout: Duration,
    /// Retries after the first attempt for transport failures.
    pub rpc_max_retries: usize,
    /// Initial backoff between RPC attempts.
    pub rpc_retry_delay: Duration,
    /// Backend key whose cluster-leader changes this node watches.
    pub watch_key: String,
    /// Partitions this node tries to lead.
    pub hosted_partitions: Vec<(String, i32)>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_address: DEFAULT_NODE_ADDRESS.to_string(),
            rpc_port: 0,
            extra_id: String::new(),
            cluster_id: DEFAULT_CLUSTER_ID.to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            rpc_max_retries: DEFAULT_RPC_MAX_RETRIES,
            rpc_retry_delay: DEFAULT_RPC_RETRY_DELAY,
            watch_key: DEFAULT_WATCH_KEY.to_string(),
            hosted_partitions: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let node_address =
            std::env::var("COORD_ADDRESS").unwrap_or_else(|_| defaults.node_address.clone());

        let rpc_port: u16 = match std::env::var("COORD_RPC_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|e| format!("Invalid COORD_RPC_PORT: {}", e))?,
            Err(_) => defaults.rpc_port,
        };

        let extra_id = std::env::var("COORD_EXTRA_ID").unwrap_or_default();

        let cluster_id =
            std::env::var("CLUSTER_ID").unwrap_or_else(|_| defaults.cluster_id.clone());

        let rpc_timeout = match std::env::var("RPC_TIMEOUT_MS") {
            Ok(value) => Duration::from_millis(
                value
                    .parse()
                    .map_err(|e| format!("Invalid RPC_TIMEOUT_MS: {}", e))?,
            ),
            Err(_) => defaults.rpc_timeout,
        };

        let rpc_max_retries: usize = match std::env::var("RPC_MAX_RETRIES") {
            Ok(value) => value
                .parse()
                .map_err(|e| format!("Invalid RPC_MAX_RETRIES: {}", e))?,
            Err(_) => defaults.rpc_max_retries,
        };

        let rpc_retry_delay = match std::env::var("RPC_RETRY_DELAY_MS") {
            Ok(value) => Duration::from_millis(
                value
                    .parse()
                    .map_err(|e| format!("Invalid RPC_RETRY_DELAY_MS: {}", e))?,
            ),
            Err(_) => defaults.rpc_retry_delay,
        };

        let watch_key = std::env::var("WATCH_KEY").unwrap_or_else(|_| defaults.watch_key.clone());

        let hosted_partitions = match std::env::var("HOSTED_PARTITIONS") {
            Ok(value) => parse_hosted_partitions(&value)?,
            Err(_) => defaults.hosted_partitions,
        };

        Ok(Self {
            node_address,
            rpc_port,
            extra_id,
            cluster_id,
            rpc_timeout,
            rpc_max_retries,
            rpc_retry_delay,
            watch_key,
            hosted_partitions,
        })
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node_address.trim().is_empty() {
            errors.push("node_address must not be empty".to_string());
        }

        if self.cluster_id.trim().is_empty() {
            errors.push("cluster_id must not be empty".to_string());
        }

        if self.watch_key.trim().is_empty() {
            errors.push("watch_key must not be empty".to_string());
        }

        if self.rpc_timeout.is_zero() {
            errors.push("rpc_timeout must be greater than zero".to_string());
        }

        if self.rpc_retry_delay > MAX_RPC_RETRY_DELAY {
            errors.push(format!(
                "rpc_retry_delay ({:?}) must not exceed {:?}",
                self.rpc_retry_delay, MAX_RPC_RETRY_DELAY
            ));
        }

        for (topic, partition) in &self.hosted_partitions {
            if topic.is_empty() {
                errors.push("hosted partition has an empty topic name".to_string());
            }
            if *partition < 0 {
                errors.push(format!(
                    "hosted partition {}:{} must be non-negative",
                    topic, partition
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Parse `"topic:0,topic:1"`. Blank entries are skipped.
fn parse_hosted_partitions(value: &str) -> Result<Vec<(String, i32)>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (topic, partition) = entry.rsplit_once(':').ok_or_else(|| {
                format!(
                    "Invalid HOSTED_PARTITIONS entry '{}': expected topic:partition",
                    entry
                )
            })?;
            let partition: i32 = partition.parse().map_err(|e| {
                format!("Invalid HOSTED_PARTITIONS entry '{}': {}", entry, e)
            })?;
            Ok((topic.to_string(), partition))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_hosted_partitions() {
        let parsed = parse_hosted_partitions("orders:0, orders:1,,events:3").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("orders".to_string(), 0),
                ("orders".to_string(), 1),
                ("events".to_string(), 3),
            ]
        );
        assert!(parse_hosted_partitions("orders").is_err());
        assert!(parse_hosted_partitions("orders:x").is_err());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let config = CoordinatorConfig {
            node_address: String::new(),
            cluster_id: " ".to_string(),
            rpc_timeout: Duration::ZERO,
            rpc_retry_delay: MAX_RPC_RETRY_DELAY + Duration::from_secs(1),
            hosted_partitions: vec![("orders".to_string(), -1)],
            ..CoordinatorConfig::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_parse_hosted_partitions_allows_colons_in_topic() {
        let parsed = parse_hosted_partitions("ns:orders:2,").unwrap();
        assert_eq!(parsed, vec![("ns:orders".to_string(), 2)]);
    }
}
