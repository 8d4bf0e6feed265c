//! Integration tests for `CoordinatorConfig::from_env()` and `LogFormat::from_env()`.
//!
//! Environment variables are process-global, so every test here runs under
//! `#[serial]` and restores the variables it touched.

use std::env;
use std::time::Duration;

use partcoord::config::CoordinatorConfig;
use partcoord::telemetry::LogFormat;
use serial_test::serial;

/// All environment variables read by `CoordinatorConfig::from_env()`.
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "COORD_ADDRESS",
    "COORD_RPC_PORT",
    "COORD_EXTRA_ID",
    "CLUSTER_ID",
    "RPC_TIMEOUT_MS",
    "RPC_MAX_RETRIES",
    "RPC_RETRY_DELAY_MS",
    "WATCH_KEY",
    "HOSTED_PARTITIONS",
    "LOG_FORMAT",
];

/// Run `f` with exactly `vars` set among the config variables.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let all_originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in all_originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

#[test]
#[serial]
fn test_from_env_without_variables_uses_defaults() {
    with_env_vars(&[], || {
        let config = CoordinatorConfig::from_env().expect("Should parse config");
        assert_eq!(config, CoordinatorConfig::default());
    });
}

#[test]
#[serial]
fn test_from_env_reads_all_fields() {
    with_env_vars(
        &[
            ("COORD_ADDRESS", "10.0.0.7"),
            ("COORD_RPC_PORT", "4250"),
            ("COORD_EXTRA_ID", "b"),
            ("CLUSTER_ID", "prod"),
            ("RPC_TIMEOUT_MS", "1500"),
            ("RPC_MAX_RETRIES", "5"),
            ("RPC_RETRY_DELAY_MS", "20"),
            ("WATCH_KEY", "lookup-leader"),
            ("HOSTED_PARTITIONS", "orders:0, orders:1,events:3"),
        ],
        || {
            let config = CoordinatorConfig::from_env().expect("Should parse config");
            assert_eq!(config.node_address, "10.0.0.7");
            assert_eq!(config.rpc_port, 4250);
            assert_eq!(config.extra_id, "b");
            assert_eq!(config.cluster_id, "prod");
            assert_eq!(config.rpc_timeout, Duration::from_millis(1500));
            assert_eq!(config.rpc_max_retries, 5);
            assert_eq!(config.rpc_retry_delay, Duration::from_millis(20));
            assert_eq!(config.watch_key, "lookup-leader");
            assert_eq!(
                config.hosted_partitions,
                vec![
                    ("orders".to_string(), 0),
                    ("orders".to_string(), 1),
                    ("events".to_string(), 3),
                ]
            );
            assert!(config.validate().is_ok());
        },
    );
}

#[test]
#[serial]
fn test_from_env_rejects_out_of_range_port() {
    with_env_vars(&[("COORD_RPC_PORT", "70000")], || {
        let err = CoordinatorConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("COORD_RPC_PORT"));
    });
}

#[test]
#[serial]
fn test_from_env_rejects_non_numeric_timeout() {
    with_env_vars(&[("RPC_TIMEOUT_MS", "soon")], || {
        let err = CoordinatorConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("RPC_TIMEOUT_MS"));
    });
}

#[test]
#[serial]
fn test_from_env_rejects_malformed_hosted_partitions() {
    with_env_vars(&[("HOSTED_PARTITIONS", "orders")], || {
        let err = CoordinatorConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("HOSTED_PARTITIONS"));
    });
}

#[test]
#[serial]
fn test_from_env_parses_but_validate_flags_zero_timeout() {
    with_env_vars(&[("RPC_TIMEOUT_MS", "0")], || {
        let config = CoordinatorConfig::from_env().expect("Should parse config");
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("rpc_timeout"));
    });
}

#[test]
#[serial]
fn test_log_format_from_env() {
    with_env_vars(&[("LOG_FORMAT", "json")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    });
    with_env_vars(&[("LOG_FORMAT", "pretty")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
    with_env_vars(&[], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}
