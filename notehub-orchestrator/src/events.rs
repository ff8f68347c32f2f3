//! Resource-event handling
//!
//! The resource monitor POSTs pressure and idle events to a webhook. The
//! HTTP handler acknowledges immediately; the work happens here, guarded by
//! a per-runtime in-flight map so duplicate events share one migration.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

use notehub_core::clients::ComputeClient;
use notehub_core::error::Result;
use notehub_core::model::{ResourceEvent, ResourceEventKind};

use crate::lifecycle::UserLifecycle;

/// Memory-pressure to instance-class table.
pub fn upgrade_target(memory_percent: Option<f64>) -> &'static str {
    match memory_percent {
        Some(p) if p >= 90.0 => "t3.xlarge",
        Some(p) if p >= 75.0 => "t3.large",
        Some(p) if p >= 50.0 => "t3.medium",
        _ => "t3.small",
    }
}

const CRITICAL_TARGET: &str = "t3.xlarge";
const GPU_TARGET: &str = "g4dn.xlarge";

pub struct ResourceEventHandler {
    compute: ComputeClient,
    lifecycle: Arc<UserLifecycle>,
    /// runtime id -> completion signal of the migration in flight.
    in_flight: DashMap<String, watch::Receiver<bool>>,
}

impl ResourceEventHandler {
    pub fn new(compute: ComputeClient, lifecycle: Arc<UserLifecycle>) -> Arc<Self> {
        Arc::new(Self {
            compute,
            lifecycle,
            in_flight: DashMap::new(),
        })
    }

    /// Process one event. Called from a spawned task; the webhook already
    /// returned 200.
    pub async fn dispatch(self: Arc<Self>, event: ResourceEvent) {
        let runtime_id = event.runtime_id.clone();
        let result = match event.kind {
            ResourceEventKind::PreProvision
            | ResourceEventKind::Migrate
            | ResourceEventKind::UrgentMigrate => {
                self.migrate_once(&runtime_id, upgrade_target(event.memory_percent))
                    .await
            }
            ResourceEventKind::Critical => self.migrate_once(&runtime_id, CRITICAL_TARGET).await,
            ResourceEventKind::GpuHint => self.migrate_once(&runtime_id, GPU_TARGET).await,
            ResourceEventKind::IdleSleep => self.lifecycle.on_idle(&runtime_id).await,
            ResourceEventKind::IdleWake => {
                // The runtime is still running; nothing to do until traffic
                // arrives and the proxy wakes the editor.
                tracing::debug!(runtime_id, "idle-wake acknowledged");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(runtime_id, kind = ?event.kind, error = %e, "resource event failed");
        }
    }

    /// Migrate a runtime at most once concurrently. A duplicate event
    /// awaits the in-flight migration instead of starting another.
    async fn migrate_once(&self, runtime_id: &str, target: &str) -> Result<()> {
        let waiter = match self.in_flight.entry(runtime_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let mut rx = occupied.get().clone();
                drop(occupied);
                tracing::debug!(runtime_id, "migration already in flight, awaiting it");
                let _ = rx.changed().await;
                return Ok(());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(false);
                vacant.insert(rx.clone());
                Waiter { tx }
            }
        };

        let result = self.migrate(runtime_id, target).await;
        self.in_flight.remove(runtime_id);
        waiter.complete();
        result
    }

    async fn migrate(&self, runtime_id: &str, target: &str) -> Result<()> {
        tracing::info!(runtime_id, target, "migrating runtime");
        let runtime = self.compute.migrate(runtime_id, target).await?;

        // The editor hot-reloads against the runtime's new location; a
        // missing editor just means the user is offline.
        if let Err(e) = self.lifecycle.runtime_moved(runtime_id, &runtime).await {
            tracing::warn!(runtime_id, error = %e, "editor notify after migration failed");
        }
        tracing::info!(runtime_id, new_runtime = %runtime.runtime_id, port = runtime.port, "migration complete");
        Ok(())
    }

}

struct Waiter {
    tx: watch::Sender<bool>,
}

impl Waiter {
    fn complete(&self) {
        let _ = self.tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_table_thresholds() {
        assert_eq!(upgrade_target(Some(95.0)), "t3.xlarge");
        assert_eq!(upgrade_target(Some(90.0)), "t3.xlarge");
        assert_eq!(upgrade_target(Some(80.0)), "t3.large");
        assert_eq!(upgrade_target(Some(75.0)), "t3.large");
        assert_eq!(upgrade_target(Some(50.0)), "t3.medium");
        assert_eq!(upgrade_target(Some(10.0)), "t3.small");
        assert_eq!(upgrade_target(None), "t3.small");
    }

    #[test]
    fn event_kinds_cover_the_webhook_contract() {
        for raw in [
            "pre-provision",
            "migrate",
            "urgent-migrate",
            "critical",
            "idle-sleep",
            "idle-wake",
            "gpu-hint",
        ] {
            let event: ResourceEvent = serde_json::from_str(&format!(
                r#"{{"type":"{raw}","runtime_id":"rt-1"}}"#
            ))
            .unwrap();
            assert_eq!(event.runtime_id, "rt-1");
        }
    }
}
