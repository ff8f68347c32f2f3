//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following
//! precedence (highest to lowest):
//! 1. Environment variables (bare names: `PORT`, `DATABASE_URL`, `SYNC_MODE`, ...)
//! 2. Current working directory: ./notehub.toml
//! 3. Default values
//!
//! The environment names are a compatibility contract with the deployment
//! tooling, so they are flat rather than nested under a prefix.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Result;

/// How the orchestrator routes legacy editor sync WebSockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Proxy straight to the editor container; the relay is not involved.
    #[default]
    Legacy,
    /// Proxy to the editor and replicate every frame to the relay best-effort.
    Mirror,
    /// Proxy to the relay; the editor container is bypassed entirely.
    RelayPrimary,
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "mirror" => Ok(Self::Mirror),
            "relay_primary" => Ok(Self::RelayPrimary),
            other => Err(format!("unknown SYNC_MODE: {other}")),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Mirror => write!(f, "mirror"),
            Self::RelayPrimary => write!(f, "relay_primary"),
        }
    }
}

/// Control-plane configuration shared by the orchestrator and the relay.
///
/// Flat on purpose: every field maps 1:1 to the environment variable of the
/// same name in SCREAMING_SNAKE_CASE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Orchestrator listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Public domain the platform is served on
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Root of per-user data directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Editor container image
    #[serde(default = "default_editor_image")]
    pub editor_image: String,

    /// Container engine binary (podman-compatible CLI)
    #[serde(default = "default_container_engine")]
    pub container_engine: String,

    /// Sibling service base URLs
    #[serde(default = "default_auth_url")]
    pub auth_service_url: String,
    #[serde(default = "default_compute_url")]
    pub compute_manager_url: String,
    #[serde(default = "default_publish_url")]
    pub publish_service_url: String,
    #[serde(default = "default_monitor_url")]
    pub resource_monitor_url: String,

    /// Sync relay location; when unset, derived from `sync_relay_port` on localhost
    #[serde(default)]
    pub sync_relay_url: Option<String>,
    #[serde(default = "default_sync_relay_port")]
    pub sync_relay_port: u16,

    /// Caddy admin API; route loading is skipped when unset
    #[serde(default)]
    pub caddy_admin_url: Option<String>,

    /// Postgres connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_ms: u64,

    /// Legacy editor sync routing mode
    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Dev-only auth bypass on the relay; "1" or "true" disables auth
    #[serde(default)]
    pub sync_relay_no_auth: String,

    /// Relay tuning
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,
    #[serde(default = "default_doc_cleanup_delay_ms")]
    pub doc_cleanup_delay_ms: u64,
    #[serde(default = "default_max_sync_connections")]
    pub max_sync_connections: usize,

    /// OAuth application credentials (relayed to AuthService)
    #[serde(default)]
    pub github_client_id: Option<String>,
    #[serde(default)]
    pub github_client_secret: Option<String>,
    #[serde(default)]
    pub google_client_id: Option<String>,
    #[serde(default)]
    pub google_client_secret: Option<String>,

    /// Region hint forwarded to the compute manager
    #[serde(default)]
    pub aws_region: Option<String>,

    /// Idle detection and lifecycle polling
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            domain: default_domain(),
            data_dir: default_data_dir(),
            editor_image: default_editor_image(),
            container_engine: default_container_engine(),
            auth_service_url: default_auth_url(),
            compute_manager_url: default_compute_url(),
            publish_service_url: default_publish_url(),
            resource_monitor_url: default_monitor_url(),
            sync_relay_url: None,
            sync_relay_port: default_sync_relay_port(),
            caddy_admin_url: None,
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            slow_query_ms: default_slow_query_ms(),
            sync_mode: SyncMode::default(),
            sync_relay_no_auth: String::new(),
            save_debounce_ms: default_save_debounce_ms(),
            doc_cleanup_delay_ms: default_doc_cleanup_delay_ms(),
            max_sync_connections: default_max_sync_connections(),
            github_client_id: None,
            github_client_secret: None,
            google_client_id: None,
            google_client_secret: None,
            aws_region: None,
            idle_timeout_minutes: default_idle_timeout_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, `./notehub.toml` and the environment.
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("notehub.toml"))
            .merge(Env::raw())
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }

    /// Base URL of the sync relay.
    pub fn relay_url(&self) -> String {
        self.sync_relay_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.sync_relay_port))
    }

    /// WebSocket base URL of the sync relay.
    pub fn relay_ws_url(&self) -> String {
        let http = self.relay_url();
        http.replacen("http", "ws", 1)
    }

    /// Whether the relay accepts unauthenticated connections (dev only).
    pub fn relay_auth_disabled(&self) -> bool {
        matches!(self.sync_relay_no_auth.as_str(), "1" | "true")
    }

    /// Session cookies carry `Secure` only when the public domain is non-local.
    pub fn secure_cookies(&self) -> bool {
        !matches!(self.domain.as_str(), "localhost" | "127.0.0.1" | "0.0.0.0")
            && !self.domain.ends_with(".local")
    }

    /// Directory holding one user's workspace.
    pub fn user_dir(&self, user_id: &uuid::Uuid) -> PathBuf {
        self.data_dir.join(user_id.to_string())
    }
}

fn default_port() -> u16 {
    3000
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_editor_image() -> String {
    "notehub-editor:latest".to_string()
}

fn default_container_engine() -> String {
    "podman".to_string()
}

fn default_auth_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_compute_url() -> String {
    "http://localhost:3002".to_string()
}

fn default_publish_url() -> String {
    "http://localhost:3003".to_string()
}

fn default_monitor_url() -> String {
    "http://localhost:3004".to_string()
}

fn default_sync_relay_port() -> u16 {
    3006
}

fn default_database_url() -> String {
    "postgres://localhost/notehub".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_slow_query_ms() -> u64 {
    200
}

fn default_save_debounce_ms() -> u64 {
    2_000
}

fn default_doc_cleanup_delay_ms() -> u64 {
    60_000
}

fn default_max_sync_connections() -> usize {
    200
}

fn default_idle_timeout_minutes() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.sync_relay_port, 3006);
        assert_eq!(config.sync_mode, SyncMode::Legacy);
        assert_eq!(config.save_debounce_ms, 2_000);
        assert_eq!(config.doc_cleanup_delay_ms, 60_000);
        assert!(!config.relay_auth_disabled());
    }

    #[test]
    fn env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PORT", "8080");
            jail.set_env("SYNC_MODE", "relay_primary");
            jail.set_env("SAVE_DEBOUNCE_MS", "250");
            jail.set_env("SYNC_RELAY_NO_AUTH", "1");
            let config = Config::load().expect("load");
            assert_eq!(config.port, 8080);
            assert_eq!(config.sync_mode, SyncMode::RelayPrimary);
            assert_eq!(config.save_debounce_ms, 250);
            assert!(config.relay_auth_disabled());
            Ok(())
        });
    }

    #[test]
    fn sync_mode_parses() {
        assert_eq!("legacy".parse::<SyncMode>().unwrap(), SyncMode::Legacy);
        assert_eq!("mirror".parse::<SyncMode>().unwrap(), SyncMode::Mirror);
        assert_eq!(
            "relay_primary".parse::<SyncMode>().unwrap(),
            SyncMode::RelayPrimary
        );
        assert!("primary".parse::<SyncMode>().is_err());
    }

    #[test]
    fn relay_url_derivation() {
        let mut config = Config::default();
        assert_eq!(config.relay_url(), "http://localhost:3006");
        assert_eq!(config.relay_ws_url(), "ws://localhost:3006");
        config.sync_relay_url = Some("http://relay.internal:9000".to_string());
        assert_eq!(config.relay_ws_url(), "ws://relay.internal:9000");
    }

    #[test]
    fn secure_cookies_only_off_localhost() {
        let mut config = Config::default();
        assert!(!config.secure_cookies());
        config.domain = "notehub.dev".to_string();
        assert!(config.secure_cookies());
    }
}
