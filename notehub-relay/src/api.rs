//! Relay HTTP API
//!
//! Documents, catalog, machines and tunnel control. Every tenant-scoped
//! route enforces that the authenticated user matches the `{user_id}` in
//! the path (`X-User-Id` from the orchestrator, or a bearer token).

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use notehub_core::error::Result;
use notehub_core::model::{CatalogEntry, MachineStatus};

use crate::auth::authorize;
use crate::hub::DocKey;
use crate::state::RelayState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "notehub-relay" }))
}

pub async fn stats(State(state): State<RelayState>) -> Json<serde_json::Value> {
    let metrics = state.metrics.snapshot();
    Json(json!({
        "metrics": metrics,
        "docs_in_memory": state.docs.len(),
        "token_cache_entries": state.tokens.len(),
    }))
}

// ----------------------------------------------------------------------
// Documents
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct DocumentQuery {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub yjs: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

impl DocumentQuery {
    /// The shape `authorize` expects for its `?token=` fallback.
    fn token_map(&self) -> HashMap<String, String> {
        self.token
            .as_ref()
            .map(|token| HashMap::from([("token".to_string(), token.clone())]))
            .unwrap_or_default()
    }
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true"))
}

#[derive(Debug, Serialize)]
struct DocumentView {
    project: String,
    #[serde(rename = "docPath")]
    doc_path: String,
    #[serde(rename = "contentHash")]
    content_hash: Option<String>,
    #[serde(rename = "byteSize")]
    byte_size: i32,
    #[serde(rename = "updatedAt")]
    updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "contentText", skip_serializing_if = "Option::is_none")]
    content_text: Option<String>,
    #[serde(rename = "yjsState", skip_serializing_if = "Option::is_none")]
    yjs_state: Option<String>,
}

pub async fn list_user_documents(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<DocumentQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    documents_response(state, user_id, None, query, headers).await
}

pub async fn list_project_documents(
    State(state): State<RelayState>,
    Path((user_id, project)): Path<(Uuid, String)>,
    Query(query): Query<DocumentQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    documents_response(state, user_id, Some(project), query, headers).await
}

async fn documents_response(
    state: RelayState,
    user_id: Uuid,
    project: Option<String>,
    query: DocumentQuery,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query.token_map(), user_id).await?;

    let with_content = flag(&query.content);
    let with_yjs = flag(&query.yjs);
    let records = state
        .store
        .list_documents(&user_id, project.as_deref(), with_content, with_yjs)
        .await?;

    let documents: Vec<DocumentView> = records
        .into_iter()
        .map(|record| {
            // A loaded doc is fresher than its last debounced save.
            let live = with_content
                .then(|| {
                    state.docs.live_content(&DocKey {
                        user_id,
                        project: record.project.clone(),
                        doc_path: record.doc_path.clone(),
                    })
                })
                .flatten();
            DocumentView {
                project: record.project,
                doc_path: record.doc_path,
                content_hash: record.content_hash,
                byte_size: record.byte_size,
                updated_at: record.updated_at,
                content_text: live.or(record.content_text),
                yjs_state: record
                    .yjs_state
                    .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
            }
        })
        .collect();

    Ok(Json(json!({ "documents": documents })))
}

// ----------------------------------------------------------------------
// Catalog + machines
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CatalogSyncRequest {
    #[serde(rename = "machineName", default)]
    pub machine_name: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub entries: Vec<CatalogEntry>,
}

pub async fn sync_catalog(
    State(state): State<RelayState>,
    Path((user_id, machine_id)): Path<(Uuid, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<CatalogSyncRequest>,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query, user_id).await?;

    state
        .store
        .sync_catalog(&user_id, &machine_id, &request.entries)
        .await?;
    state
        .store
        .upsert_machine(
            &user_id,
            &machine_id,
            request.machine_name.as_deref(),
            request.hostname.as_deref(),
            &request.capabilities,
            MachineStatus::Online,
        )
        .await?;

    Ok(Json(json!({ "synced": request.entries.len() })))
}

pub async fn get_catalog(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query, user_id).await?;

    let project = query.get("project").map(String::as_str);
    let rows = state.store.list_catalog(&user_id, project).await?;

    // machine -> project -> docs
    let mut machines: BTreeMap<String, BTreeMap<String, Vec<serde_json::Value>>> = BTreeMap::new();
    for (machine_id, entry) in rows {
        machines
            .entry(machine_id)
            .or_default()
            .entry(entry.project.clone())
            .or_default()
            .push(json!({
                "docPath": entry.doc_path,
                "contentHash": entry.content_hash,
                "byteSize": entry.byte_size,
            }));
    }

    let machines: Vec<serde_json::Value> = machines
        .into_iter()
        .map(|(machine_id, projects)| {
            json!({
                "machineId": machine_id,
                "projects": projects
                    .into_iter()
                    .map(|(project, docs)| json!({ "project": project, "docs": docs }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(Json(json!({ "machines": machines })))
}

pub async fn list_machines(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query, user_id).await?;

    let machines = state.store.list_machines(&user_id).await?;
    let counts: HashMap<String, (i64, i64)> = state
        .store
        .machine_doc_counts(&user_id)
        .await?
        .into_iter()
        .map(|(machine_id, docs, projects)| (machine_id, (docs, projects)))
        .collect();

    let machines: Vec<serde_json::Value> = machines
        .into_iter()
        .map(|machine| {
            let (docs, projects) = counts.get(&machine.machine_id).copied().unwrap_or((0, 0));
            json!({
                "machineId": machine.machine_id,
                "machineName": machine.machine_name,
                "hostname": machine.hostname,
                "status": machine.status,
                "lastSeen": machine.last_seen,
                "connectedAt": machine.connected_at,
                "docCount": docs,
                "projectCount": projects,
            })
        })
        .collect();

    Ok(Json(json!({ "machines": machines })))
}

// ----------------------------------------------------------------------
// Tunnel control
// ----------------------------------------------------------------------

pub async fn tunnel_status(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query, user_id).await?;
    let status = state.tunnels.status(user_id);
    Ok(Json(serde_json::to_value(status).unwrap_or_default()))
}

pub async fn tunnel_machines(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query, user_id).await?;
    let status = state.tunnels.status(user_id);
    Ok(Json(json!({ "machines": status.machines })))
}

pub async fn tunnel_active(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query, user_id).await?;
    let status = state.tunnels.status(user_id);
    Ok(Json(json!({ "activeMachineId": status.active_machine_id })))
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    #[serde(rename = "machineId")]
    pub machine_id: Option<String>,
}

pub async fn set_tunnel_active(
    State(state): State<RelayState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<SetActiveRequest>,
) -> Result<Json<serde_json::Value>> {
    authorize(&state, &headers, &query, user_id).await?;
    let status = state.tunnels.set_active(user_id, request.machine_id).await?;
    Ok(Json(json!({ "activeMachineId": status.active_machine_id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_ones_and_trues() {
        assert!(flag(&Some("1".to_string())));
        assert!(flag(&Some("true".to_string())));
        assert!(!flag(&Some("0".to_string())));
        assert!(!flag(&None));
    }

    #[test]
    fn set_active_accepts_explicit_null() {
        let request: SetActiveRequest = serde_json::from_str(r#"{"machineId":null}"#).unwrap();
        assert!(request.machine_id.is_none());
        let request: SetActiveRequest = serde_json::from_str(r#"{"machineId":"m2"}"#).unwrap();
        assert_eq!(request.machine_id.as_deref(), Some("m2"));
    }
}
