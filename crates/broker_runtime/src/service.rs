//! Service lifecycle contract and shutdown plumbing.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A long-running back-end service.
///
/// `start` must return only once all subscriptions are live; `stop` cancels
/// periodic work, drains in-flight work up to the service's grace period,
/// and returns an error if the drain timed out.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Start the service, block until SIGINT/SIGTERM, then stop it.
pub async fn run_until_shutdown(service: &dyn Service) -> Result<()> {
    service.start().await?;
    tracing::info!("{} running; waiting for shutdown signal", service.name());

    wait_for_signal().await;
    tracing::info!("{} shutting down", service.name());
    service.stop().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl+C");
}

/// Await spawned loops up to a grace period. Loops are expected to exit on
/// their own once their cancellation token fires; work is never killed
/// mid-item.
pub async fn drain_tasks(tasks: Vec<JoinHandle<()>>, grace: Duration) -> Result<()> {
    let drain = async {
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("Task ended abnormally during drain: {}", e);
                }
            }
        }
    };
    tokio::time::timeout(grace, drain)
        .await
        .map_err(|_| anyhow!("Drain exceeded grace period of {:?}", grace))
}
