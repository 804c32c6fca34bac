//! Structured logging infrastructure for Meshgate.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Text,
    /// One JSON object per line, for log aggregation
    Json,
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use meshgate_core::logging;
///
/// logging::init();
/// tracing::info!("Gateway started");
/// ```
pub fn init() {
    init_with(LogFormat::Text, "info");
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
/// Log level can be configured via the `RUST_LOG` environment variable.
///
/// # Example
/// ```no_run
/// use meshgate_core::logging;
///
/// logging::init_json();
/// tracing::info!(service = "meshgate-node", "Service started");
/// ```
pub fn init_json() {
    init_with(LogFormat::Json, "info");
}

/// Initialize logging with an explicit format and fallback level.
///
/// Logs go to stderr; stdout is left to the service's data stream.
/// `RUST_LOG` still takes precedence over `default_level` when present.
pub fn init_with(format: LogFormat, default_level: &str) {
    let filter = build_filter(default_level);

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .init(),
    }
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
