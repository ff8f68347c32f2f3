//! ResourceMonitor client
//!
//! Registration is best-effort; the caller decides whether a failure is
//! fatal (it never is, per the lifecycle contract).

use serde_json::json;
use uuid::Uuid;

use super::ServiceClient;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct MonitorClient {
    inner: ServiceClient,
}

impl MonitorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: ServiceClient::new("resource-monitor", base_url),
        }
    }

    /// Watch a runtime. `idle_timeout_minutes` tells the monitor when to
    /// emit `idle-sleep` for it.
    pub async fn register_runtime(
        &self,
        runtime_id: &str,
        container_name: &str,
        user_id: &Uuid,
        idle_timeout_minutes: u64,
    ) -> Result<()> {
        self.inner
            .post_unit(
                "/api/watch",
                &json!({
                    "runtime_id": runtime_id,
                    "container_name": container_name,
                    "user_id": user_id,
                    "idle_timeout_minutes": idle_timeout_minutes,
                }),
            )
            .await
    }

    pub async fn unregister_runtime(&self, runtime_id: &str) -> Result<()> {
        self.inner.delete(&format!("/api/watch/{runtime_id}")).await
    }

    pub async fn health(&self) -> Result<()> {
        self.inner.health().await
    }
}
