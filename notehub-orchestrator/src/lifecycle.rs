//! Per-user editor + runtime lifecycle
//!
//! Owns the `activeEditors` map: startup on login, teardown on logout,
//! snapshot/restore around idle sleep, boot-time reconciliation against
//! running containers, and the periodic health loop. Starts are serialized
//! per user so concurrent logins provision exactly one runtime.

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use notehub_core::clients::{ComputeClient, MonitorClient};
use notehub_core::error::{Error, Result};
use notehub_core::model::{Plan, RuntimeInfo, User};
use notehub_core::Config;

use crate::containers::{editor_container_name, ContainerDriver, EditorSpec};

const EDITOR_PORT_RANGE: std::ops::Range<u16> = 20_000..40_000;
const EDITOR_HEALTH_CEILING: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EditorState {
    Active,
    Idle,
}

/// Everything the orchestrator knows about one user's pair of containers.
#[derive(Debug, Clone, Serialize)]
pub struct EditorInfo {
    pub user: User,
    pub editor_port: u16,
    pub editor_container: String,
    /// Unknown for entries recovered by reconciliation until the compute
    /// manager confirms the runtime.
    pub runtime_id: Option<String>,
    pub runtime_container: Option<String>,
    pub runtime_port: u16,
    pub host: String,
    pub state: EditorState,
    pub snapshot_id: Option<String>,
}

pub struct UserLifecycle {
    config: Arc<Config>,
    driver: ContainerDriver,
    compute: ComputeClient,
    monitor: MonitorClient,
    editors: DashMap<Uuid, EditorInfo>,
    /// Per-user start serialization; a second login awaits the first.
    start_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    http: reqwest::Client,
}

impl UserLifecycle {
    pub fn new(
        config: Arc<Config>,
        driver: ContainerDriver,
        compute: ComputeClient,
        monitor: MonitorClient,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            driver,
            compute,
            monitor,
            editors: DashMap::new(),
            start_locks: DashMap::new(),
            http,
        })
    }

    pub fn get(&self, user_id: &Uuid) -> Option<EditorInfo> {
        self.editors.get(user_id).map(|e| e.clone())
    }

    pub fn find_by_runtime(&self, runtime_id: &str) -> Option<EditorInfo> {
        self.editors
            .iter()
            .find(|kv| kv.value().runtime_id.as_deref() == Some(runtime_id))
            .map(|kv| kv.value().clone())
    }

    pub fn list(&self) -> Vec<EditorInfo> {
        self.editors.iter().map(|kv| kv.value().clone()).collect()
    }

    /// The editor for a user, starting (or waking) the pair if needed.
    pub async fn ensure_editor(&self, user: &User) -> Result<EditorInfo> {
        if let Some(info) = self.get(&user.id) {
            if info.state == EditorState::Active {
                return Ok(info);
            }
        }

        let lock = self
            .start_locks
            .entry(user.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A concurrent login may have finished the start while we waited.
        if let Some(info) = self.get(&user.id) {
            if info.state == EditorState::Active {
                return Ok(info);
            }
            if info.state == EditorState::Idle {
                return self.wake(user, info).await;
            }
        }

        self.start_fresh(user).await
    }

    async fn start_fresh(&self, user: &User) -> Result<EditorInfo> {
        tracing::info!(user_id = %user.id, "starting editor + runtime");

        self.scaffold_workspace(&user.id).await?;
        let runtime = self.compute.start_runtime(&user.id).await?;
        let info = self.start_editor_for(user, &runtime).await?;

        // Monitor registration is best-effort; pressure events simply won't
        // fire for this runtime if it fails.
        if let Err(e) = self
            .monitor
            .register_runtime(
                &runtime.runtime_id,
                &runtime.container_name,
                &user.id,
                self.config.idle_timeout_minutes,
            )
            .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "resource monitor registration failed");
        }

        self.editors.insert(user.id, info.clone());
        Ok(info)
    }

    /// Start the editor container against a known runtime and wait for it
    /// to answer health.
    async fn start_editor_for(&self, user: &User, runtime: &RuntimeInfo) -> Result<EditorInfo> {
        let editor_port = self.pick_editor_port().await?;
        let user_dir = self.config.user_dir(&user.id);

        let editor_container = self
            .driver
            .run_editor(&EditorSpec {
                user,
                editor_port,
                runtime_port: runtime.port,
                image: &self.config.editor_image,
                user_dir: &user_dir,
            })
            .await?;

        self.wait_editor_health(editor_port).await.map_err(|e| {
            tracing::error!(user_id = %user.id, error = %e, "editor failed health, aborting start");
            e
        })?;

        Ok(EditorInfo {
            user: user.clone(),
            editor_port,
            editor_container,
            runtime_id: Some(runtime.runtime_id.clone()),
            runtime_container: Some(runtime.container_name.clone()),
            runtime_port: runtime.port,
            host: runtime.host.clone(),
            state: EditorState::Active,
            snapshot_id: None,
        })
    }

    /// Tear the pair down on logout.
    pub async fn stop_user(&self, user_id: &Uuid) -> Result<()> {
        let Some((_, info)) = self.editors.remove(user_id) else {
            return Ok(());
        };
        tracing::info!(user_id = %user_id, "stopping editor + runtime");

        self.driver.remove_container(&info.editor_container).await?;

        if let Some(runtime_id) = &info.runtime_id {
            if let Err(e) = self.monitor.unregister_runtime(runtime_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "monitor unregister failed");
            }
            if let Err(e) = self.compute.stop_runtime(runtime_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "runtime stop failed");
            }
        }
        Ok(())
    }

    /// Idle sleep: snapshot the runtime, stop both containers, keep the map
    /// entry so the snapshot can be restored later.
    pub async fn on_idle(&self, runtime_id: &str) -> Result<()> {
        let Some(info) = self.find_by_runtime(runtime_id) else {
            return Err(Error::NotFound(format!("no editor for runtime {runtime_id}")));
        };
        let user_id = info.user.id;
        tracing::info!(user_id = %user_id, runtime_id, "idle sleep: snapshotting runtime");

        let snapshot = self.compute.snapshot(runtime_id).await?;
        self.driver.remove_container(&info.editor_container).await?;
        if let Err(e) = self.compute.stop_runtime(runtime_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "runtime stop after snapshot failed");
        }

        if let Some(mut entry) = self.editors.get_mut(&user_id) {
            entry.state = EditorState::Idle;
            entry.snapshot_id = Some(snapshot.snapshot_id.clone());
        }
        tracing::info!(user_id = %user_id, snapshot_id = %snapshot.snapshot_id, "user idled");
        Ok(())
    }

    /// Return from idle: restore the snapshot if one exists, otherwise (or
    /// on restore failure) fall back to a fresh start.
    async fn wake(&self, user: &User, info: EditorInfo) -> Result<EditorInfo> {
        if let Some(snapshot_id) = &info.snapshot_id {
            tracing::info!(user_id = %user.id, snapshot_id, "restoring runtime from snapshot");
            match self.compute.restore(snapshot_id, &user.id).await {
                Ok(runtime) => {
                    let info = self.start_editor_for(user, &runtime).await?;
                    if let Err(e) = self
                        .monitor
                        .register_runtime(
                            &runtime.runtime_id,
                            &runtime.container_name,
                            &user.id,
                            self.config.idle_timeout_minutes,
                        )
                        .await
                    {
                        tracing::warn!(user_id = %user.id, error = %e, "monitor re-registration failed");
                    }
                    self.editors.insert(user.id, info.clone());
                    return Ok(info);
                }
                Err(e) => {
                    tracing::warn!(user_id = %user.id, error = %e, "restore failed, starting fresh");
                }
            }
        }
        self.start_fresh(user).await
    }

    /// A migration moved the runtime; hot-notify the editor so it reconnects
    /// without a restart.
    pub async fn runtime_moved(&self, runtime_id: &str, runtime: &RuntimeInfo) -> Result<()> {
        let Some(info) = self.find_by_runtime(runtime_id) else {
            return Err(Error::NotFound(format!("no editor for runtime {runtime_id}")));
        };

        let url = format!(
            "http://localhost:{}/api/runtime/update-port",
            info.editor_port
        );
        self.http
            .post(&url)
            .json(&serde_json::json!({
                "runtime_port": runtime.port,
                "host": runtime.host,
            }))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("editor notify failed: {e}")))?;

        if let Some(mut entry) = self.editors.get_mut(&info.user.id) {
            entry.runtime_id = Some(runtime.runtime_id.clone());
            entry.runtime_container = Some(runtime.container_name.clone());
            entry.runtime_port = runtime.port;
            entry.host = runtime.host.clone();
        }
        tracing::info!(user_id = %info.user.id, runtime_id, new_port = runtime.port, "editor notified of runtime move");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation & health
    // ------------------------------------------------------------------

    /// Rebuild the editor map from containers that survived an orchestrator
    /// restart. Idempotent: a second run produces the same map.
    pub async fn reconcile(&self) -> Result<usize> {
        let running = self.driver.list_running().await?;
        let mut recovered = 0usize;

        for container in running {
            let env = match self.driver.inspect_env(&container.name).await {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(container = %container.name, error = %e, "env inspect failed");
                    continue;
                }
            };

            let Some(info) = editor_info_from_env(&env) else {
                tracing::warn!(container = %container.name, "editor container missing identity env");
                continue;
            };

            if !self.probe_editor(info.editor_port).await {
                tracing::warn!(
                    container = %container.name,
                    port = info.editor_port,
                    "running editor not answering health, skipping"
                );
                continue;
            }

            tracing::info!(
                user_id = %info.user.id,
                container = %container.name,
                "editor recovered by reconciliation"
            );
            self.editors.insert(info.user.id, info);
            recovered += 1;
        }

        tracing::info!(recovered, "reconciliation complete");
        Ok(recovered)
    }

    /// One pass of the periodic health check.
    pub async fn health_pass(&self) {
        let entries = self.list();
        for info in entries {
            if info.state != EditorState::Active {
                continue;
            }

            if !self.probe_editor(info.editor_port).await {
                self.recover_editor(&info).await;
            }

            if !self.probe_runtime(&info).await {
                self.recover_runtime(&info).await;
            }
        }
    }

    /// Run the health loop until shutdown.
    pub async fn health_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1_000)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.health_pass().await,
                _ = shutdown.cancelled() => break,
            }
        }
    }

    async fn recover_editor(&self, info: &EditorInfo) {
        match self.driver.inspect_status(&info.editor_container).await {
            Ok(Some(status)) if status.eq_ignore_ascii_case("exited") => {
                tracing::warn!(user_id = %info.user.id, "editor exited, restarting");
                if let Err(e) = self.driver.start_container(&info.editor_container).await {
                    tracing::error!(user_id = %info.user.id, error = %e, "editor restart failed");
                }
            }
            Ok(Some(_)) => {
                // Still running but unhealthy; the container's own restart
                // policy handles crash loops.
            }
            Ok(None) => {
                tracing::warn!(user_id = %info.user.id, "editor container gone, dropping entry");
                self.editors.remove(&info.user.id);
            }
            Err(e) => {
                tracing::warn!(user_id = %info.user.id, error = %e, "editor status inspect failed");
            }
        }
    }

    async fn recover_runtime(&self, info: &EditorInfo) {
        // The compute manager may already have moved the runtime (e.g. a
        // migration we missed); resync our record before restarting anything.
        if let Some(runtime_id) = &info.runtime_id {
            if let Ok(runtime) = self.compute.get_runtime(runtime_id).await {
                if runtime.port != info.runtime_port || runtime.host != info.host {
                    tracing::info!(user_id = %info.user.id, port = runtime.port, "runtime moved, resyncing");
                    if let Err(e) = self.runtime_moved(runtime_id, &runtime).await {
                        tracing::warn!(user_id = %info.user.id, error = %e, "runtime resync failed");
                    }
                    return;
                }
            }
        }

        let Some(container) = &info.runtime_container else {
            return;
        };
        tracing::warn!(user_id = %info.user.id, "runtime not answering, attempting start");
        if let Err(e) = self.driver.start_container(container).await {
            tracing::warn!(user_id = %info.user.id, error = %e, "runtime start failed");
        }
    }

    async fn probe_editor(&self, port: u16) -> bool {
        let url = format!("http://localhost:{port}/health");
        matches!(self.http.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    /// The MRP capabilities endpoint doubles as the runtime liveness probe.
    async fn probe_runtime(&self, info: &EditorInfo) -> bool {
        let url = format!("http://{}:{}/capabilities", info.host, info.runtime_port);
        matches!(self.http.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    async fn wait_editor_health(&self, port: u16) -> Result<()> {
        let deadline = tokio::time::Instant::now() + EDITOR_HEALTH_CEILING;
        while tokio::time::Instant::now() < deadline {
            if self.probe_editor(port).await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(Error::Timeout(format!("editor on port {port} never became healthy")))
    }

    /// Random free port in [20000, 40000).
    async fn pick_editor_port(&self) -> Result<u16> {
        for _ in 0..64 {
            let candidate = {
                let mut rng = rand::rng();
                rng.random_range(EDITOR_PORT_RANGE)
            };
            if TcpListener::bind(("127.0.0.1", candidate)).await.is_ok() {
                return Ok(candidate);
            }
        }
        Err(Error::Internal("no free editor port found".to_string()))
    }

    /// Create the on-disk workspace scaffold. Idempotent; existing files
    /// are never overwritten.
    async fn scaffold_workspace(&self, user_id: &Uuid) -> Result<()> {
        let user_dir = self.config.user_dir(user_id);
        let scratch = user_dir.join("Projects").join("Scratch");
        let tutorial = user_dir.join("Projects").join("Tutorial");

        tokio::fs::create_dir_all(&scratch).await?;
        tokio::fs::create_dir_all(&tutorial).await?;

        write_if_missing(&scratch.join("scratch.md"), SCRATCH_DEFAULT).await?;
        write_if_missing(&tutorial.join("welcome.md"), TUTORIAL_DEFAULT).await?;

        // The editor container runs as ubuntu (uid 1000); ownership matters
        // only when we run privileged, so a failure is just logged.
        let chown = tokio::process::Command::new("chown")
            .args(["-R", "1000:1000"])
            .arg(&user_dir)
            .status()
            .await;
        if !matches!(chown, Ok(status) if status.success()) {
            tracing::debug!(user_id = %user_id, "workspace chown skipped");
        }

        Ok(())
    }
}

async fn write_if_missing(path: &Path, contents: &str) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        return Ok(());
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}

/// Rebuild an [`EditorInfo`] from the identity env an editor container was
/// started with.
fn editor_info_from_env(env: &std::collections::HashMap<String, String>) -> Option<EditorInfo> {
    let user_id: Uuid = env.get("CLOUD_USER_ID")?.parse().ok()?;
    let editor_port: u16 = env.get("PORT")?.parse().ok()?;
    let runtime_port: u16 = env.get("RUNTIME_PORT")?.parse().ok()?;

    let user = User {
        id: user_id,
        email: env.get("CLOUD_USER_EMAIL").cloned().unwrap_or_default(),
        username: env.get("CLOUD_USER_USERNAME").cloned().unwrap_or_default(),
        name: env.get("CLOUD_USER_NAME").cloned().unwrap_or_default(),
        avatar: env.get("CLOUD_USER_AVATAR").filter(|a| !a.is_empty()).cloned(),
        plan: env
            .get("CLOUD_USER_PLAN")
            .and_then(|p| serde_json::from_value(serde_json::Value::String(p.clone())).ok())
            .unwrap_or(Plan::Free),
    };

    Some(EditorInfo {
        editor_container: editor_container_name(&user.id),
        user,
        editor_port,
        runtime_id: None,
        runtime_container: None,
        runtime_port,
        host: "localhost".to_string(),
        state: EditorState::Active,
        snapshot_id: None,
    })
}

const SCRATCH_DEFAULT: &str = "# Scratch\n\nQuick notes live here. Anything in this project is yours to mess up.\n";

const TUTORIAL_DEFAULT: &str = "# Welcome\n\nThis notebook runs code on your cloud runtime. Open a code block and press run.\n\n```python\nprint(\"hello from your runtime\")\n```\n";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<String, String> {
        HashMap::from([
            ("CLOUD_USER_ID".to_string(), "7f2c1a90-9d1e-4a9f-aaaa-000000000001".to_string()),
            ("CLOUD_USER_EMAIL".to_string(), "a@b.c".to_string()),
            ("CLOUD_USER_USERNAME".to_string(), "ada".to_string()),
            ("CLOUD_USER_NAME".to_string(), "Ada".to_string()),
            ("CLOUD_USER_PLAN".to_string(), "pro".to_string()),
            ("PORT".to_string(), "23456".to_string()),
            ("RUNTIME_PORT".to_string(), "34567".to_string()),
        ])
    }

    #[test]
    fn env_reconstruction_round_trips() {
        let info = editor_info_from_env(&full_env()).expect("info");
        assert_eq!(info.editor_port, 23_456);
        assert_eq!(info.runtime_port, 34_567);
        assert_eq!(info.user.username, "ada");
        assert_eq!(info.user.plan, Plan::Pro);
        assert_eq!(info.editor_container, "editor-7f2c1a90");
        assert_eq!(info.state, EditorState::Active);
    }

    #[test]
    fn env_reconstruction_requires_identity() {
        let mut env = full_env();
        env.remove("CLOUD_USER_ID");
        assert!(editor_info_from_env(&env).is_none());

        let mut env = full_env();
        env.insert("PORT".to_string(), "not-a-port".to_string());
        assert!(editor_info_from_env(&env).is_none());
    }

    #[test]
    fn editor_port_range_matches_contract() {
        assert_eq!(EDITOR_PORT_RANGE.start, 20_000);
        assert_eq!(EDITOR_PORT_RANGE.end, 40_000);
    }
}
