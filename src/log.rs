//! Structured logging for conductor.
//!
//! Log levels:
//! - ERROR: Transport failures and other conditions the coordinator cannot recover from
//! - WARN: Rejections, retries, timeouts and evictions
//! - INFO: Lifecycle events (registration, admission, dispatch, completion)
//! - DEBUG: Routing decisions and dependency graph edits
//! - TRACE: Raw protocol traffic
//!
//! `RUST_LOG` takes precedence. Otherwise debug mode can be enabled with the
//! `--debug` flag or `CONDUCTOR_DEBUG=1` env var.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Whether debug logging was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Default filter directive for the given debug setting.
pub fn default_directive(debug: bool) -> &'static str {
    if debug || env_debug() {
        "conductor=debug,info"
    } else {
        "info"
    }
}

/// Initialize the global subscriber.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(debug_enabled: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if result.is_ok() {
        tracing::debug!(?format, debug_enabled, "logging initialized");
    }
}
