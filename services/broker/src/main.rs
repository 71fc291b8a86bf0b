// Broker service main entry point.
mod observability;

use anyhow::Result;
use broker::{BrokerConfig, ServerHandle};
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("gmsg-broker")?;
    let config = BrokerConfig::from_env_or_yaml()?;

    // Expose Prometheus metrics on the configured bind address.
    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let server = ServerHandle::start(config).await?;
    tracing::info!(url = %server.client_url(), "broker started");

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    server.shutdown().await;
    tracing::info!("broker stopped");
    Ok(())
}
