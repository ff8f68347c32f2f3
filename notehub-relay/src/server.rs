//! Relay HTTP/WebSocket server with graceful shutdown

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use notehub_core::error::Result;

use crate::state::RelayState;
use crate::{api, sync_ws, tunnel};

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/stats", get(api::stats))
        .route("/sync/{user_id}/{project}/{*doc_path}", get(sync_ws::sync_upgrade))
        .route("/tunnel/{user_id}", get(tunnel::tunnel_upgrade))
        .route("/api/documents/{user_id}", get(api::list_user_documents))
        .route(
            "/api/documents/{user_id}/{project}",
            get(api::list_project_documents),
        )
        .route("/api/catalog/{user_id}", get(api::get_catalog))
        .route("/api/catalog/{user_id}/{machine_id}", post(api::sync_catalog))
        .route("/api/machines/{user_id}", get(api::list_machines))
        .route("/api/tunnel/{user_id}", get(api::tunnel_status))
        .route("/api/tunnel/{user_id}/machines", get(api::tunnel_machines))
        .route(
            "/api/tunnel/{user_id}/active",
            get(api::tunnel_active).post(api::set_tunnel_active),
        )
        .with_state(state)
}

/// Run the relay until SIGTERM/SIGINT, then close every socket with 1001
/// and flush all dirty documents before returning.
pub async fn serve(state: RelayState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.sync_relay_port));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("sync relay listening on {}", addr);

    let app = router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new());

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let drain = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.cancelled().await })
        .await?;

    // Socket loops saw the cancellation and are sending their 1001 closes;
    // the durable part is ours: nothing dirty may outlive the process.
    state.docs.flush_all().await;
    tracing::info!("sync relay shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notehub_core::{Config, PostgresStore};

    /// Route syntax is only validated when the router is built; this
    /// catches bad path patterns without a running server.
    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://127.0.0.1:1/notehub_test")
            .expect("lazy pool");
        let state = RelayState::new(Config::default(), PostgresStore::from_pool(pool, 200));
        let _ = router(state);
    }
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
