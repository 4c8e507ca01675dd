//! Structured logging initialization.
//!
//! Log level can be configured via the `RUST_LOG` environment variable and
//! defaults to `info`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter from `RUST_LOG`, falling back to `info`
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging with human-readable output.
///
/// # Example
/// ```no_run
/// use fieldlink_core::logging;
///
/// logging::init();
/// tracing::info!("gateway started");
/// ```
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize logging with JSON output for log shipping.
///
/// Uses `try_init` so a second call (e.g. from tests) is a no-op.
pub fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init();
}
