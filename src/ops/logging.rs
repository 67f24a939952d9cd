//! Log subscriber setup.

use anyhow::Result;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Environment variable holding the log filter (`error`, `warn`, `info`,
/// `debug`, `trace` or a full `EnvFilter` directive).
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Parse a filter directive, falling back to `info` when it is missing or
/// malformed.
pub fn log_filter(level: Option<&str>) -> EnvFilter {
    let level = level.unwrap_or("info");
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs are written to stderr so job output on
/// stdout stays machine readable.
pub fn init_tracing(log_level: Option<&str>, json: bool) -> Result<()> {
    let filter = log_filter(log_level);
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))
}
