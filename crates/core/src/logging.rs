//! Logging initialization.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,framesync=debug";

/// Initialize the logging system with tracing.
///
/// `RUST_LOG` takes precedence; otherwise [`DEFAULT_FILTER`] is used.
///
/// # Example
/// ```
/// framesync_core::init_logging();
/// tracing::info!("Frame sync initialized");
/// ```
pub fn init_logging() {
    init_logging_with_filter(DEFAULT_FILTER);
}

/// Initialize logging with a fallback filter, typically taken from
/// [`DebugConfig::log_filter`](crate::DebugConfig).
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber installed.
pub fn init_logging_with_filter(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
