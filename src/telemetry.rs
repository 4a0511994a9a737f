//! Tracing setup for embedders and tests.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber filtered by `RUST_LOG`, falling back to `level`.
///
/// Returns false when a subscriber was already installed.
pub fn init_tracing(level: &str, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(fmt::layer().json()).try_init().is_ok()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
            .is_ok()
    }
}
