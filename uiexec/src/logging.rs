//! Development-time tracing.
//!
//! Tracing output goes to stderr and is filtered by `RUST_LOG`. It is separate
//! from the attempt logs in `io/attempt_log`, which are product artifacts and
//! are written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: `RUST_LOG` filter (default `warn`), compact
/// stderr output.
///
/// ```bash
/// RUST_LOG=uiexec=debug uiexec run --suite tests/ui
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
