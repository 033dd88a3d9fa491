//! Tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

/// Install a default fmt subscriber honoring `RUST_LOG`. Safe to call more
/// than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
