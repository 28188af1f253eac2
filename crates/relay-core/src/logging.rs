//! Tracing bootstrap shared by binaries and tests.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}
