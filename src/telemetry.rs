//! Logging setup for node coordinator processes.
//!
//! ```rust,no_run
//! use partcoord::telemetry::{LogFormat, init_logging};
//!
//! init_logging(LogFormat::from_env()).expect("Failed to init logging");
//! ```
//!
//! # Environment Variables
//!
//! - `LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `RUST_LOG`: log filter directives (default: `info`)

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output (default).
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from the `LOG_FORMAT` environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_target(true),
                )
                .try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().with_target(true))
                .try_init()?;
        }
    }

    tracing::debug!(?format, "Logging initialized");
    Ok(())
}
