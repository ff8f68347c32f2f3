use notehub_core::observability::init_tracing;
use notehub_core::{Config, PostgresStore};
use notehub_orchestrator::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing("info,sqlx=warn");

    let store = PostgresStore::connect(
        &config.database_url,
        config.db_max_connections,
        config.slow_query_ms,
    )
    .await?;

    let state = AppState::new(config, store);
    notehub_orchestrator::server::serve(state).await?;
    Ok(())
}
