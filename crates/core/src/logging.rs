//! Structured logging infrastructure for qmesh.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter from `RUST_LOG`, falling back to `default_level`.
fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `default_level`. Repeated calls are ignored.
///
/// # Example
/// ```no_run
/// use qmesh_core::logging;
///
/// logging::init("info");
/// tracing::info!("Mesh node started");
/// ```
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(build_filter(default_level))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
///
/// # Example
/// ```no_run
/// use qmesh_core::logging;
///
/// logging::init_json("info");
/// tracing::info!(component = "routing", "Routing cycle complete");
/// ```
pub fn init_json(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(build_filter(default_level))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init();
}

/// Initialize from the node section of the configuration.
pub fn init_from_config(config: &crate::config::NodeConfig) {
    if config.json_logs {
        init_json(&config.log_level);
    } else {
        init(&config.log_level);
    }
}
