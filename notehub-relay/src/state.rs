//! Relay application state

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use notehub_core::clients::AuthClient;
use notehub_core::{Config, PostgresStore, TokenCache};

use crate::hub::DocHub;
use crate::metrics::RelayMetrics;
use crate::tunnel::TunnelHub;

/// Shared state for every relay handler.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<Config>,
    pub store: PostgresStore,
    pub auth: AuthClient,
    pub tokens: Arc<TokenCache>,
    pub docs: Arc<DocHub>,
    pub tunnels: Arc<TunnelHub>,
    pub metrics: Arc<RelayMetrics>,
    /// Cancelled on SIGTERM/SIGINT; every socket loop selects on it.
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(config: Config, store: PostgresStore) -> Self {
        let metrics = Arc::new(RelayMetrics::default());
        let docs = DocHub::new(
            store.clone(),
            metrics.clone(),
            Duration::from_millis(config.save_debounce_ms),
            Duration::from_millis(config.doc_cleanup_delay_ms),
        );
        let tunnels = TunnelHub::new(store.clone());
        let auth = AuthClient::new(config.auth_service_url.clone());

        Self {
            config: Arc::new(config),
            store,
            auth,
            tokens: Arc::new(TokenCache::new()),
            docs,
            tunnels,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }
}
