//! Diagnostics via `tracing`, written to stderr.
//!
//! Attempt logs (captured agent output) are product artifacts written by the
//! executor and are unaffected by the filter configured here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn`, or `agentloop=debug` when `verbose`.
///
/// # Example
/// ```bash
/// RUST_LOG=agentloop=debug agentloop run --tasks tasks.json
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,agentloop=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
