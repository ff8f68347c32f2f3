//! Tracing initialization

use tracing_subscriber::EnvFilter;

/// Initialize tracing with JSON formatting and env-filter support.
///
/// `RUST_LOG` wins over the passed default so operators can turn modules up
/// and down without a restart of the whole fleet configuration.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}
