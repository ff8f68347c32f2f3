use notehub_core::observability::init_tracing;
use notehub_core::{Config, PostgresStore};
use notehub_relay::RelayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing("info,sqlx=warn");

    // Schema init is the one hard-fatal failure: without Postgres there is
    // nothing durable to relay.
    let store = PostgresStore::connect(
        &config.database_url,
        config.db_max_connections,
        config.slow_query_ms,
    )
    .await?;

    let state = RelayState::new(config, store);
    notehub_relay::server::serve(state).await?;
    Ok(())
}
