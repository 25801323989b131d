//! Tracing initialization for hosts embedding the runtime
//!
//! The core logs through `tracing` everywhere; hosts pick the subscriber.
//! These helpers install a sensible default: env-filtered, human-readable
//! or JSON-structured output.

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a human-readable subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init();
}

/// Installs a JSON subscriber filtered by `RUST_LOG`, for log pipelines.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing_json() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter())
        .with_current_span(true)
        .try_init();
}
