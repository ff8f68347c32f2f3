//! Orchestrator HTTP server: routes, boot sequence, graceful shutdown

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use notehub_core::error::{Error, Result};
use notehub_core::model::ResourceEvent;

use crate::caddy::CaddyAdmin;
use crate::proxy;
use crate::session::AuthedUser;
use crate::state::AppState;
use crate::supervisor::ServiceSpec;
use crate::ui;

pub fn router(state: AppState) -> Router {
    Router::new()
        // Health & introspection
        .route("/health", get(health))
        .route("/api/health", get(aggregate_health))
        .route("/api/services", get(services))
        // Auth & pages
        .route("/login", get(ui::login_page))
        .route("/login/github", get(ui::login_github))
        .route("/login/google", get(ui::login_google))
        .route("/auth/callback/{provider}", get(ui::oauth_callback))
        .route("/auth/magic-link", post(ui::send_magic_link))
        .route("/auth/verify", get(ui::verify_magic_link))
        .route("/logout", post(ui::logout))
        .route("/account/delete", post(ui::delete_account))
        .route("/dashboard", get(ui::dashboard))
        .route("/sandbox", get(ui::sandbox))
        // Project import
        .route("/projects/import", post(import_project))
        // Resource webhook
        .route("/hooks/resource", post(resource_hook))
        // Sync + tunnel WebSocket routing
        .route("/sync/{user_id}/{project}/{*doc_path}", get(proxy::ws::sync_ws))
        .route("/tunnel/{user_id}", get(proxy::ws::tunnel_ws))
        // Authenticated editor proxy (HTTP + WS)
        .route("/u/{user_id}", any(proxy::editor_root))
        .route("/u/{user_id}/{*rest}", any(proxy::editor_entry))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Aggregate health: 200 only when every dependency answers.
async fn aggregate_health(State(state): State<AppState>) -> impl IntoResponse {
    let (auth, compute, monitor, db) = tokio::join!(
        state.auth.health(),
        state.compute.health(),
        state.monitor.health(),
        sqlx::query("SELECT 1").fetch_one(state.store.pool()),
    );

    let checks = json!({
        "auth_service": auth.is_ok(),
        "compute_manager": compute.is_ok(),
        "resource_monitor": monitor.is_ok(),
        "database": db.is_ok(),
    });
    let all_ok = checks
        .as_object()
        .map(|map| map.values().all(|v| v.as_bool().unwrap_or(false)))
        .unwrap_or(false);

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ok": all_ok, "checks": checks })))
}

/// Supervised service states plus the active editor list.
async fn services(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services: serde_json::Value = state
        .supervisor
        .statuses()
        .into_iter()
        .map(|(name, status)| (name, serde_json::to_value(status).unwrap_or_default()))
        .collect::<serde_json::Map<_, _>>()
        .into();

    let editors: Vec<serde_json::Value> = state
        .lifecycle
        .list()
        .into_iter()
        .map(|info| {
            json!({
                "userId": info.user.id,
                "editorPort": info.editor_port,
                "runtimeId": info.runtime_id,
                "state": info.state,
            })
        })
        .collect();

    Json(json!({ "services": services, "editors": editors }))
}

/// Webhook sink: acknowledge immediately, process asynchronously.
async fn resource_hook(
    State(state): State<AppState>,
    Json(event): Json<ResourceEvent>,
) -> StatusCode {
    tracing::info!(kind = ?event.kind, runtime_id = %event.runtime_id, "resource event");
    let events = state.events.clone();
    tokio::spawn(events.dispatch(event));
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    repo_url: String,
    name: Option<String>,
}

/// Clone a git repository into the user's Projects directory.
async fn import_project(
    State(state): State<AppState>,
    authed: AuthedUser,
    Json(request): Json<ImportRequest>,
) -> Result<Json<serde_json::Value>> {
    if !request.repo_url.starts_with("https://") && !request.repo_url.starts_with("http://") {
        return Err(Error::BadRequest("repo_url must be http(s)".to_string()));
    }

    let name = match request.name {
        Some(name) => name,
        None => request
            .repo_url
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or("imported")
            .to_string(),
    };
    if name.is_empty() || name.contains(['/', '.']) {
        return Err(Error::BadRequest("invalid project name".to_string()));
    }

    let target = state
        .config
        .user_dir(&authed.user.id)
        .join("Projects")
        .join(&name);
    if tokio::fs::try_exists(&target).await? {
        return Err(Error::BadRequest(format!("project {name} already exists")));
    }

    let output = tokio::process::Command::new("git")
        .arg("clone")
        .arg("--depth")
        .arg("1")
        .arg(&request.repo_url)
        .arg(&target)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::warn!(user_id = %authed.user.id, repo = %request.repo_url, stderr, "import failed");
        return Err(Error::BadRequest(format!("clone failed: {stderr}")));
    }

    tracing::info!(user_id = %authed.user.id, project = %name, "project imported");
    Ok(Json(json!({ "project": name })))
}

// ----------------------------------------------------------------------
// Boot
// ----------------------------------------------------------------------

/// Sibling services the supervisor owns. Commands come from `*_CMD` env
/// vars; the sync relay defaults to the binary that ships next to ours.
fn sibling_services(state: &AppState) -> Vec<ServiceSpec> {
    let cmd = |var: &str| std::env::var(var).ok().as_deref().and_then(ServiceSpec::command_from_str);

    let relay_command = cmd("SYNC_RELAY_CMD").or_else(|| {
        let sibling = std::env::current_exe()
            .ok()?
            .with_file_name("notehub-relay");
        Some(vec![sibling.to_string_lossy().into_owned()])
    });

    vec![
        ServiceSpec {
            name: "auth-service",
            command: cmd("AUTH_SERVICE_CMD"),
            health_url: format!("{}/health", state.config.auth_service_url),
        },
        ServiceSpec {
            name: "compute-manager",
            command: cmd("COMPUTE_MANAGER_CMD"),
            health_url: format!("{}/health", state.config.compute_manager_url),
        },
        ServiceSpec {
            name: "resource-monitor",
            command: cmd("RESOURCE_MONITOR_CMD"),
            health_url: format!("{}/health", state.config.resource_monitor_url),
        },
        ServiceSpec {
            name: "publish-service",
            command: cmd("PUBLISH_SERVICE_CMD"),
            health_url: format!("{}/health", state.config.publish_service_url),
        },
        ServiceSpec {
            name: "sync-relay",
            command: relay_command,
            health_url: format!("{}/health", state.config.relay_url()),
        },
    ]
}

/// Full boot: edge routes, sibling services, reconciliation, health loop,
/// then serve until a signal arrives.
pub async fn serve(state: AppState) -> Result<()> {
    if let Some(admin_url) = &state.config.caddy_admin_url {
        CaddyAdmin::new(admin_url.clone()).load_routes(&state.config).await;
    }

    let failed = state.supervisor.start_all(sibling_services(&state)).await;
    if !failed.is_empty() {
        tracing::warn!(?failed, "some sibling services are unavailable");
    }

    // Crash-safety: adopt editor containers that outlived a restart.
    if let Err(e) = state.lifecycle.reconcile().await {
        tracing::warn!(error = %e, "reconciliation failed");
    }

    tokio::spawn(
        state
            .lifecycle
            .clone()
            .health_loop(state.shutdown.child_token()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("orchestrator listening on {}", addr);

    let app = router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new());

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let drain = state.shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { drain.cancelled().await })
    .await?;

    state.supervisor.stop_all().await;
    tracing::info!("orchestrator shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notehub_core::{Config, PostgresStore};

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://127.0.0.1:1/notehub_test")
            .expect("lazy pool");
        let state = AppState::new(Config::default(), PostgresStore::from_pool(pool, 200));
        let _ = router(state);
    }

    #[tokio::test]
    async fn sibling_service_set_is_fixed() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://127.0.0.1:1/notehub_test")
            .expect("lazy pool");
        let state = AppState::new(Config::default(), PostgresStore::from_pool(pool, 200));
        let services = sibling_services(&state);
        let names: Vec<_> = services.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            [
                "auth-service",
                "compute-manager",
                "resource-monitor",
                "publish-service",
                "sync-relay"
            ]
        );
        // The relay always has a spawn command (sibling binary fallback).
        assert!(services.last().unwrap().command.is_some());
    }

    #[test]
    fn import_name_derivation() {
        // Mirrors the logic in import_project for the default-name path.
        let derive = |url: &str| {
            url.trim_end_matches('/')
                .trim_end_matches(".git")
                .rsplit('/')
                .next()
                .unwrap_or("imported")
                .to_string()
        };
        assert_eq!(derive("https://github.com/a/b.git"), "b");
        assert_eq!(derive("https://github.com/a/b/"), "b");
        assert_eq!(derive("https://github.com/a/b"), "b");
    }
}
