//! Orchestrator application state

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use notehub_core::clients::{AuthClient, ComputeClient, MonitorClient};
use notehub_core::{Config, PostgresStore, TokenCache};

use crate::containers::ContainerDriver;
use crate::events::ResourceEventHandler;
use crate::lifecycle::UserLifecycle;
use crate::proxy::throttle::ThrottledLog;
use crate::supervisor::ProcessSupervisor;

/// Shared state for every orchestrator handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: PostgresStore,
    pub auth: AuthClient,
    pub compute: ComputeClient,
    pub monitor: MonitorClient,
    pub tokens: Arc<TokenCache>,
    pub driver: ContainerDriver,
    pub lifecycle: Arc<UserLifecycle>,
    pub events: Arc<ResourceEventHandler>,
    pub supervisor: Arc<ProcessSupervisor>,
    /// Plain client for proxying and internal probes; no global timeout so
    /// long-polling editor requests are not cut off.
    pub http: reqwest::Client,
    pub ws_log: Arc<ThrottledLog>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, store: PostgresStore) -> Self {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let auth = AuthClient::new(config.auth_service_url.clone());
        let compute = ComputeClient::new(
            config.compute_manager_url.clone(),
            config.aws_region.clone(),
        );
        let monitor = MonitorClient::new(config.resource_monitor_url.clone());
        let driver = ContainerDriver::new(config.container_engine.clone());

        let lifecycle = UserLifecycle::new(
            config.clone(),
            driver.clone(),
            compute.clone(),
            monitor.clone(),
        );
        let events = ResourceEventHandler::new(compute.clone(), lifecycle.clone());
        let supervisor = Arc::new(ProcessSupervisor::new(shutdown.child_token()));

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            config,
            store,
            auth,
            compute,
            monitor,
            tokens: Arc::new(TokenCache::new()),
            driver,
            lifecycle,
            events,
            supervisor,
            http,
            ws_log: Arc::new(ThrottledLog::new()),
            shutdown,
        }
    }
}
