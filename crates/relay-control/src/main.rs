//! relayd - forwarding control plane daemon

use anyhow::Context;
use relay_control::{telemetry, ControlConfig, ControlPlane, DEFAULT_CONFIG_PATH};
use relay_store::SqliteStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    tracing::info!("relayd v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = ControlConfig::resolve(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;

    let store = SqliteStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("opening database")?
        .with_resolver(config.partition_resolver()?);
    store.health_check().await.context("database health check")?;

    let plane = ControlPlane::start(Arc::new(store), &config);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    let report = plane.shutdown().await;
    let stats = serde_json::to_string(&plane.stats())?;
    tracing::info!(%stats, "final statistics");
    if report.lost() > 0 {
        anyhow::bail!("{} accounting items were not written", report.lost());
    }
    Ok(())
}
