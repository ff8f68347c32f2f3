//! ComputeManager client
//!
//! Runtime containers are provisioned, snapshotted and migrated by the
//! compute manager; the orchestrator only asks.

use serde_json::json;
use uuid::Uuid;

use super::ServiceClient;
use crate::error::Result;
use crate::model::{RuntimeInfo, SnapshotInfo};

#[derive(Debug, Clone)]
pub struct ComputeClient {
    inner: ServiceClient,
    region: Option<String>,
}

impl ComputeClient {
    pub fn new(base_url: impl Into<String>, region: Option<String>) -> Self {
        Self {
            inner: ServiceClient::new("compute-manager", base_url),
            region,
        }
    }

    /// Provision (or return the existing) runtime container for a user.
    pub async fn start_runtime(&self, user_id: &Uuid) -> Result<RuntimeInfo> {
        self.inner
            .post_json(
                "/api/runtimes",
                &json!({ "user_id": user_id, "region": self.region }),
            )
            .await
    }

    pub async fn get_runtime(&self, runtime_id: &str) -> Result<RuntimeInfo> {
        self.inner
            .get_json(&format!("/api/runtimes/{runtime_id}"))
            .await
    }

    pub async fn stop_runtime(&self, runtime_id: &str) -> Result<()> {
        self.inner.delete(&format!("/api/runtimes/{runtime_id}")).await
    }

    /// Live-migrate a runtime to another instance class. The reply carries
    /// the runtime's new location.
    pub async fn migrate(&self, runtime_id: &str, target_type: &str) -> Result<RuntimeInfo> {
        self.inner
            .post_json(
                &format!("/api/runtimes/{runtime_id}/migrate"),
                &json!({ "target_type": target_type }),
            )
            .await
    }

    /// Take a CRIU snapshot of a runtime (for idle sleep).
    pub async fn snapshot(&self, runtime_id: &str) -> Result<SnapshotInfo> {
        self.inner
            .post_json(
                &format!("/api/runtimes/{runtime_id}/snapshot"),
                &json!({}),
            )
            .await
    }

    /// Restore a snapshotted runtime; returns its new location.
    pub async fn restore(&self, snapshot_id: &str, user_id: &Uuid) -> Result<RuntimeInfo> {
        self.inner
            .post_json(
                "/api/runtimes/restore",
                &json!({ "snapshot_id": snapshot_id, "user_id": user_id }),
            )
            .await
    }

    pub async fn health(&self) -> Result<()> {
        self.inner.health().await
    }
}
