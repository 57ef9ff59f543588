use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use ctbackup_api::app::{build_app, services::AppServices};
use ctbackup_infra::clock::SystemClock;
use ctbackup_infra::config::ServiceConfig;
use ctbackup_infra::jobs::JobRegistry;
use ctbackup_infra::runtime::LxdRuntime;
use ctbackup_infra::workers::EvictionWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ctbackup_observability::init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    let runtime = LxdRuntime::connect(&config.lxd)
        .await
        .with_context(|| format!("failed to connect to LXD at {}", config.lxd.endpoint))?;
    info!(
        endpoint = %config.lxd.endpoint,
        version = runtime.server_version(),
        "connected to LXD"
    );

    let registry = JobRegistry::arc(Arc::new(SystemClock), config.retention);
    let eviction = EvictionWorker::spawn(registry.clone(), config.prune_interval)
        .context("failed to start eviction worker")?;

    let services = Arc::new(AppServices::new(registry, Arc::new(runtime), &config));
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    eviction.shutdown();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
