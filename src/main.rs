//! # InterHub Entry Point

use std::sync::Arc;

use anyhow::Context;
use inthub::{
    config::ConfigLoader,
    db::{TenantConnector, init_pool},
    migration::{Migrator, MigratorTrait},
    scheduler::SlackCollector,
    server::{AppState, Clients, run_server},
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;

fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: inthub::config::AppConfig) -> anyhow::Result<()> {
    init_tracing(&config).context("failed to initialize tracing")?;
    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Effective configuration");
    }

    let db = init_pool(&config)
        .await
        .context("failed to open master database")?;
    Migrator::up(&db, None)
        .await
        .context("failed to apply master migrations")?;
    tracing::info!("Master database migrations applied");

    let config = Arc::new(config);
    let tenants = Arc::new(TenantConnector::from_config(&config));
    let clients = Clients::from_config(&config);
    let state = AppState::new(Arc::clone(&config), db.clone(), tenants, clients)
        .context("invalid crypto key")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    if config.collector.enabled {
        let collector =
            SlackCollector::new(db, Arc::clone(&state.slack), config.collector.clone());
        tokio::spawn(collector.run(shutdown.clone()));
    }

    run_server(state, shutdown).await
}
