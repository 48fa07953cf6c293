//! Flash-sale fulfillment process.
//!
//! Seeds the stock ledger, runs the fulfillment workers and the reconciler,
//! and drains in-flight deliveries on Ctrl+C or SIGTERM.

use anyhow::Context;
use flashsale_runtime::metrics::MetricsServer;
use flashsale_runtime::shutdown::wait_for_signal;
use flashsale_service::{BootstrapError, Config, Services, init_tracing};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.server.log_format);

    info!(
        redis_url = %config.redis.url,
        redpanda_brokers = %config.redpanda.brokers,
        topic = %config.redpanda.order_topic,
        workers = config.workers.count,
        node_id = config.workers.node_id,
        "Starting flash-sale fulfillment service"
    );

    let services = match start(&config).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, class = e.class().as_str(), "Startup failed");
            return Err(e.into());
        },
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let reconciler = services.reconciler().map(|r| r.spawn(shutdown_rx));
    if reconciler.is_none() {
        info!("Reconciliation disabled");
    }

    let mut pool = services.worker_pool();
    pool.start(config.workers.count);

    let health = services.health_monitor().check().await;
    info!(status = %health.status, "Fulfillment service ready");

    wait_for_signal().await;
    info!(
        timeout_secs = config.server.shutdown_timeout,
        in_flight = pool.in_flight(),
        "Shutting down, draining workers"
    );

    let drained = pool.drain(config.shutdown_timeout()).await;
    // No receivers left means the reconciler already exited.
    let _ = shutdown_tx.send(());
    if let Some(handle) = reconciler {
        if let Err(e) = handle.await {
            warn!(error = %e, "Reconciler task failed");
        }
    }

    drained.context("Worker pool did not drain cleanly")?;
    info!("Fulfillment service stopped");
    Ok(())
}

/// Metrics, connectivity, migrations and startup seeding.
async fn start(config: &Config) -> Result<Services, BootstrapError> {
    let mut metrics = MetricsServer::new(config.metrics_addr()?);
    metrics.start()?;

    let services = Services::connect(config).await?;
    let report = services.seeder().seed_all().await?;
    info!(
        seeded = report.seeded,
        present = report.present,
        "Startup seeding complete"
    );
    Ok(services)
}
