//! Sibling-service supervision
//!
//! Starts a fixed set of sibling services, each health-gated: a service
//! already answering on its port is left alone, anything we spawn is
//! restarted on exit with exponential backoff (capped at 30 s), and the
//! backoff counter resets once the service passes a health check again.

use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dashmap::DashMap;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READINESS_CEILING: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(5);
const MAX_BACKOFF_SECS: u64 = 30;

/// One supervised sibling service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: &'static str,
    /// Spawn argv. `None` means the service is expected to be managed
    /// externally; it is only health-checked.
    pub command: Option<Vec<String>>,
    pub health_url: String,
}

impl ServiceSpec {
    /// Parse a whitespace-separated command from an env-style string.
    pub fn command_from_str(raw: &str) -> Option<Vec<String>> {
        let argv: Vec<String> = raw.split_whitespace().map(String::from).collect();
        (!argv.is_empty()).then_some(argv)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ServiceStatus {
    /// Healthy instance found on the port; nothing spawned.
    External,
    /// Spawned and passing health checks.
    Running { restarts: u32 },
    /// Spawned but never became healthy (still retrying).
    Unhealthy { restarts: u32 },
    /// No command configured and nothing answering.
    Unavailable,
    Stopped,
}

pub struct ProcessSupervisor {
    statuses: Arc<DashMap<&'static str, ServiceStatus>>,
    http: reqwest::Client,
    shutdown: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    pub fn new(shutdown: CancellationToken) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            statuses: Arc::new(DashMap::new()),
            http,
            shutdown,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start every service and gate on health for up to 30 s each. Partial
    /// failure is non-fatal; the returned list names the unhealthy ones.
    pub async fn start_all(&self, services: Vec<ServiceSpec>) -> Vec<&'static str> {
        let mut failed = Vec::new();

        for spec in services {
            if self.probe(&spec.health_url).await {
                tracing::info!(service = spec.name, "external instance healthy, not spawning");
                self.statuses.insert(spec.name, ServiceStatus::External);
                continue;
            }

            let Some(command) = spec.command.clone() else {
                tracing::warn!(service = spec.name, "not running and no command configured");
                self.statuses.insert(spec.name, ServiceStatus::Unavailable);
                failed.push(spec.name);
                continue;
            };

            self.statuses
                .insert(spec.name, ServiceStatus::Unhealthy { restarts: 0 });
            let task = self.spawn_supervised(spec.clone(), command);
            self.tasks.lock().await.push(task);

            if self.wait_healthy(&spec.health_url, READINESS_CEILING).await {
                tracing::info!(service = spec.name, "service healthy");
            } else {
                tracing::warn!(service = spec.name, "service did not become healthy in time");
                failed.push(spec.name);
            }
        }

        failed
    }

    pub fn statuses(&self) -> Vec<(String, ServiceStatus)> {
        self.statuses
            .iter()
            .map(|kv| (kv.key().to_string(), kv.value().clone()))
            .collect()
    }

    /// Spawn-and-restart loop for one service.
    fn spawn_supervised(&self, spec: ServiceSpec, command: Vec<String>) -> JoinHandle<()> {
        let statuses = self.statuses.clone();
        let http = self.http.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut restarts: u32 = 0;

            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                let mut child = match Command::new(&command[0])
                    .args(&command[1..])
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                {
                    Ok(child) => child,
                    Err(e) => {
                        tracing::error!(service = spec.name, error = %e, "spawn failed");
                        statuses.insert(spec.name, ServiceStatus::Unhealthy { restarts });
                        restarts += 1;
                        tokio::time::sleep(backoff(restarts)).await;
                        continue;
                    }
                };

                stream_output(spec.name, &mut child);
                tracing::info!(service = spec.name, pid = child.id(), "service spawned");

                // Reset the backoff counter once the child proves healthy.
                let health_url = spec.health_url.clone();
                let reset = {
                    let http = http.clone();
                    let statuses = statuses.clone();
                    let name = spec.name;
                    let restarts_seen = restarts;
                    tokio::spawn(async move {
                        if wait_healthy_with(&http, &health_url, READINESS_CEILING).await {
                            statuses.insert(name, ServiceStatus::Running { restarts: restarts_seen });
                            true
                        } else {
                            false
                        }
                    })
                };

                tokio::select! {
                    exit = child.wait() => {
                        reset.abort();
                        let became_healthy = matches!(
                            statuses.get(spec.name).map(|s| s.clone()),
                            Some(ServiceStatus::Running { .. })
                        );
                        if became_healthy {
                            restarts = 0;
                        }
                        match exit {
                            Ok(status) => tracing::warn!(
                                service = spec.name,
                                code = status.code(),
                                "service exited"
                            ),
                            Err(e) => tracing::error!(service = spec.name, error = %e, "wait failed"),
                        }
                        restarts += 1;
                        statuses.insert(spec.name, ServiceStatus::Unhealthy { restarts });
                        let delay = backoff(restarts);
                        tracing::info!(service = spec.name, restarts, delay_secs = delay.as_secs(), "restarting after backoff");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    _ = shutdown.cancelled() => {
                        reset.abort();
                        terminate(spec.name, &mut child).await;
                        break;
                    }
                }
            }

            statuses.insert(spec.name, ServiceStatus::Stopped);
        })
    }

    /// Stop every supervised child: SIGTERM, 5 s grace, SIGKILL.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("all supervised services stopped");
    }

    async fn probe(&self, url: &str) -> bool {
        matches!(self.http.get(url).send().await, Ok(r) if r.status().is_success())
    }

    async fn wait_healthy(&self, url: &str, ceiling: Duration) -> bool {
        wait_healthy_with(&self.http, url, ceiling).await
    }
}

async fn wait_healthy_with(http: &reqwest::Client, url: &str, ceiling: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + ceiling;
    while tokio::time::Instant::now() < deadline {
        if matches!(http.get(url).send().await, Ok(r) if r.status().is_success()) {
            return true;
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
    false
}

/// `min(2^(n-1) s, 30 s)`
fn backoff(restarts: u32) -> Duration {
    let exp = restarts.saturating_sub(1).min(10);
    Duration::from_secs((1u64 << exp).min(MAX_BACKOFF_SECS))
}

/// Prefix-stream a child's stdout/stderr into the log.
fn stream_output(name: &'static str, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(service = name, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(service = name, "{line}");
            }
        });
    }
}

/// SIGTERM via `kill`, then SIGKILL after the grace period. The `kill`
/// binary is used because tokio's `Child::kill` only delivers SIGKILL.
async fn terminate(name: &'static str, child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
            tracing::info!(service = name, "service stopped cleanly");
            return;
        }
    }
    let _ = child.kill().await;
    tracing::warn!(service = name, "service killed after grace period");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(6), Duration::from_secs(30));
        assert_eq!(backoff(60), Duration::from_secs(30));
    }

    #[test]
    fn command_parsing() {
        assert_eq!(
            ServiceSpec::command_from_str("node server.js --port 3001"),
            Some(vec![
                "node".to_string(),
                "server.js".to_string(),
                "--port".to_string(),
                "3001".to_string()
            ])
        );
        assert_eq!(ServiceSpec::command_from_str("   "), None);
    }

    #[tokio::test]
    async fn supervised_service_restarts_after_exit() {
        let shutdown = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(shutdown.clone());

        // A command that exits immediately; health never passes, so the
        // supervisor keeps it in Unhealthy with a growing restart count.
        let spec = ServiceSpec {
            name: "flaky",
            command: Some(vec!["true".to_string()]),
            health_url: "http://127.0.0.1:1/health".to_string(),
        };
        let task = supervisor.spawn_supervised(spec, vec!["true".to_string()]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let restarts = match supervisor.statuses.get("flaky").map(|s| s.clone()) {
            Some(ServiceStatus::Unhealthy { restarts }) => restarts,
            other => panic!("unexpected status: {other:?}"),
        };
        assert!(restarts >= 1);

        shutdown.cancel();
        let _ = task.await;
        assert_eq!(
            supervisor.statuses.get("flaky").map(|s| s.clone()),
            Some(ServiceStatus::Stopped)
        );
    }
}
