//! fabricmeshd — long-running node process.
//!
//! Loads configuration, starts discovery and the worker server, and
//! runs until the process is signaled to stop. No CLI argument
//! parsing and no terminal dashboard — both are thin collaborators
//! that live outside this core.

use std::sync::Arc;

use fabricmesh_core::config::GroupConfig;
use fabricmesh_core::discovery::Discovery;
use fabricmesh_core::executor::ContainerExecutor;
use fabricmesh_core::history::HistoryLog;
use fabricmesh_core::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GroupConfig::load_or_create()?;
    tracing::info!(name = %config.name, "starting fabricmesh node");

    let discovery = Arc::new(Discovery::bind(config.clone(), true).await?);
    discovery.spawn_background_tasks();

    let executor = Arc::new(ContainerExecutor::connect(config.clone())?);
    if !executor.is_available().await {
        tracing::warn!("Docker daemon not reachable; job execution will fail until it is");
    }

    let history = Arc::new(HistoryLog::default_path()?);
    let worker = Arc::new(Worker::new(
        config.clone(),
        Arc::clone(&executor),
        Some(Arc::clone(&discovery)),
        history,
    ));

    let worker_handle = tokio::spawn(async move { worker.serve().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    discovery.stop();
    worker_handle.abort();

    Ok(())
}
