//! Development-time tracing for diagnosing runs.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   The batch driver captures it into `history/{id}.log`.
//!
//! - **Artifacts (`io/artifacts`)**: Product output under the output directory.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for run logging.
///
/// Reads `RUST_LOG` env var. Defaults to `info` if unset so step summaries
/// reach the history log.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=rca=debug rca run --id 1 --objective "..."
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
