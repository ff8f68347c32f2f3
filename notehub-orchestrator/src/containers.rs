//! Container engine driver
//!
//! Thin subprocess surface over a podman-compatible CLI for the editor
//! containers the orchestrator owns (runtime containers belong to the
//! compute manager). Argv is always list-form; nothing user-controlled is
//! ever passed through a shell.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

use notehub_core::error::{Error, Result};
use notehub_core::model::User;

const RUN_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Editor container parameters for one user.
#[derive(Debug, Clone)]
pub struct EditorSpec<'a> {
    pub user: &'a User,
    pub editor_port: u16,
    pub runtime_port: u16,
    pub image: &'a str,
    pub user_dir: &'a Path,
}

/// A running editor container as reported by `ps`.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct ContainerDriver {
    engine: String,
}

/// Container name for a user's editor: `editor-` + first uuid segment.
pub fn editor_container_name(user_id: &Uuid) -> String {
    let id = user_id.to_string();
    let short = id.split('-').next().unwrap_or(&id).to_string();
    format!("editor-{short}")
}

impl ContainerDriver {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
        }
    }

    /// Start an editor container, replacing any stale one of the same name.
    /// Returns the container name.
    pub async fn run_editor(&self, spec: &EditorSpec<'_>) -> Result<String> {
        let name = editor_container_name(&spec.user.id);

        // `--replace` covers the common engine, but a crashed container in
        // `Created` state can still collide; clear it explicitly first.
        self.remove_container(&name).await?;

        let user_dir = spec.user_dir.display().to_string();
        let editor_port = spec.editor_port.to_string();
        let runtime_port = spec.runtime_port.to_string();
        let plan = serde_json::to_value(spec.user.plan)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "free".to_string());

        let args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--replace".into(),
            "--restart=on-failure:5".into(),
            "--name".into(),
            name.clone(),
            "--network=host".into(),
            "--memory=512m".into(),
            "-v".into(),
            format!("{user_dir}:/home/ubuntu"),
            "-e".into(),
            "HOME=/home/ubuntu".into(),
            "-e".into(),
            "USER=ubuntu".into(),
            "-e".into(),
            "LOGNAME=ubuntu".into(),
            "-e".into(),
            "CLOUD_MODE=1".into(),
            "-e".into(),
            format!("RUNTIME_PORT={runtime_port}"),
            "-e".into(),
            format!("PORT={editor_port}"),
            "-e".into(),
            format!("BASE_PATH=/u/{}/", spec.user.id),
            "-e".into(),
            format!("CLOUD_USER_ID={}", spec.user.id),
            "-e".into(),
            format!("CLOUD_USER_NAME={}", spec.user.name),
            "-e".into(),
            format!("CLOUD_USER_USERNAME={}", spec.user.username),
            "-e".into(),
            format!("CLOUD_USER_EMAIL={}", spec.user.email),
            "-e".into(),
            format!("CLOUD_USER_AVATAR={}", spec.user.avatar.as_deref().unwrap_or("")),
            "-e".into(),
            format!("CLOUD_USER_PLAN={plan}"),
            spec.image.into(),
            "node".into(),
            "/app/mrmd-server/bin/cli.js".into(),
            "--port".into(),
            editor_port,
            "--host".into(),
            "0.0.0.0".into(),
            "--no-auth".into(),
            "/home/ubuntu".into(),
        ];

        self.exec(&args, RUN_TIMEOUT).await?;
        tracing::info!(
            user_id = %spec.user.id,
            container = %name,
            editor_port = spec.editor_port,
            "editor container started"
        );
        Ok(name)
    }

    /// `rm -f`; a missing container is not an error.
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        match self
            .exec(&["rm".into(), "-f".into(), name.into()], INSPECT_TIMEOUT)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Container(stderr)) if is_not_found(&stderr) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `start` an existing (exited) container.
    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.exec(&["start".into(), name.into()], RUN_TIMEOUT).await?;
        Ok(())
    }

    /// Running editor containers, for reconciliation.
    pub async fn list_running(&self) -> Result<Vec<RunningContainer>> {
        let stdout = self
            .exec(
                &[
                    "ps".into(),
                    "--filter".into(),
                    "name=editor-".into(),
                    "--format".into(),
                    "{{.Names}}|{{.Status}}".into(),
                ],
                INSPECT_TIMEOUT,
            )
            .await?;

        Ok(stdout
            .lines()
            .filter_map(|line| {
                let (name, status) = line.split_once('|')?;
                Some(RunningContainer {
                    name: name.trim().to_string(),
                    status: status.trim().to_string(),
                })
            })
            .collect())
    }

    /// Container environment as a map, for reconciliation.
    pub async fn inspect_env(&self, name: &str) -> Result<HashMap<String, String>> {
        let stdout = self
            .exec(
                &[
                    "inspect".into(),
                    "--format".into(),
                    "{{json .Config.Env}}".into(),
                    name.into(),
                ],
                INSPECT_TIMEOUT,
            )
            .await?;

        let env_list: Vec<String> = serde_json::from_str(stdout.trim())
            .map_err(|e| Error::Container(format!("unparseable env for {name}: {e}")))?;

        Ok(env_list
            .into_iter()
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect())
    }

    /// Container status string (`running`, `exited`, ...); `None` when the
    /// container is gone.
    pub async fn inspect_status(&self, name: &str) -> Result<Option<String>> {
        match self
            .exec(
                &[
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Status}}".into(),
                    name.into(),
                ],
                INSPECT_TIMEOUT,
            )
            .await
        {
            Ok(stdout) => Ok(Some(stdout.trim().to_string())),
            Err(Error::Container(stderr)) if is_not_found(&stderr) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run one engine command with a hard timeout; non-zero exit surfaces
    /// captured stderr.
    async fn exec(&self, args: &[String], timeout: Duration) -> Result<String> {
        let mut command = Command::new(&self.engine);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "{} {} exceeded {:?}",
                    self.engine,
                    args.first().map(String::as_str).unwrap_or(""),
                    timeout
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Container(format!(
                "{} {} exited {}: {stderr}",
                self.engine,
                args.first().map(String::as_str).unwrap_or(""),
                output.status.code().unwrap_or(-1),
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no such container") || lowered.contains("no container with name")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editor_name_uses_short_uuid() {
        let id: Uuid = "7f2c1a90-9d1e-4a9f-aaaa-000000000001".parse().unwrap();
        assert_eq!(editor_container_name(&id), "editor-7f2c1a90");
    }

    #[test]
    fn not_found_detection_covers_both_engines() {
        assert!(is_not_found("Error: no such container: editor-x"));
        assert!(is_not_found("Error: no container with name or ID \"editor-x\" found"));
        assert!(!is_not_found("permission denied"));
    }

    #[test]
    fn ps_line_parsing() {
        let line = "editor-7f2c1a90|Up 3 hours";
        let (name, status) = line.split_once('|').unwrap();
        assert_eq!(name, "editor-7f2c1a90");
        assert!(status.starts_with("Up"));
    }
}
