//! Domain model shared by the orchestrator and the relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription plan, owned by AuthService.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Team,
}

/// A platform user. Created and updated by AuthService; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub plan: Plan,
}

/// A registered desktop machine offering compute over the tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub user_id: Uuid,
    pub machine_id: String,
    #[serde(default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: MachineStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Offline,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// One row of a machine's file catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub project: String,
    #[serde(rename = "docPath")]
    pub doc_path: String,
    #[serde(rename = "contentHash", default)]
    pub content_hash: Option<String>,
    #[serde(rename = "byteSize", default)]
    pub byte_size: i32,
}

/// Persisted document row, without the binary state unless asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub user_id: Uuid,
    pub project: String,
    pub doc_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yjs_state: Option<Vec<u8>>,
    pub content_hash: Option<String>,
    pub byte_size: i32,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A runtime container as reported by the compute manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub runtime_id: String,
    pub container_name: String,
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

/// A CRIU snapshot handle from the compute manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
}

/// Resource events pushed by the resource monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEvent {
    #[serde(rename = "type")]
    pub kind: ResourceEventKind,
    pub runtime_id: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ResourceEventKind {
    #[serde(rename = "pre-provision")]
    PreProvision,
    #[serde(rename = "migrate")]
    Migrate,
    #[serde(rename = "urgent-migrate")]
    UrgentMigrate,
    #[serde(rename = "critical")]
    Critical,
    #[serde(rename = "idle-sleep")]
    IdleSleep,
    #[serde(rename = "idle-wake")]
    IdleWake,
    #[serde(rename = "gpu-hint")]
    GpuHint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_event_parses_wire_names() {
        let event: ResourceEvent = serde_json::from_str(
            r#"{"type":"urgent-migrate","runtime_id":"rt-1","container_name":"c1","memory_percent":91.5}"#,
        )
        .unwrap();
        assert_eq!(event.kind, ResourceEventKind::UrgentMigrate);
        assert_eq!(event.runtime_id, "rt-1");
        assert_eq!(event.memory_percent, Some(91.5));
    }

    #[test]
    fn catalog_entry_uses_camel_case_wire_names() {
        let entry: CatalogEntry = serde_json::from_str(
            r#"{"project":"Scratch","docPath":"notes/a.md","contentHash":"abc","byteSize":42}"#,
        )
        .unwrap();
        assert_eq!(entry.doc_path, "notes/a.md");
        assert_eq!(entry.byte_size, 42);
    }

    #[test]
    fn user_tolerates_missing_optionals() {
        let user: User = serde_json::from_str(
            r#"{"id":"7f2c1a90-9d1e-4a9f-aaaa-000000000001","email":"a@b.c"}"#,
        )
        .unwrap();
        assert_eq!(user.plan, Plan::Free);
        assert!(user.username.is_empty());
    }
}
