//! Development-time tracing for debugging the worker.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`; it is not part
//! of the product state. The agent log and progress files the orchestrator
//! reads are written explicitly and are unaffected by this module.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for worker diagnostics.
///
/// Reads `RUST_LOG`, defaulting to `info` — worker stderr lands in the
/// agent log via the bootstrap tee, so iteration-level messages should be
/// visible by default.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
