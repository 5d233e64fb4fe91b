use anyhow::{Context, Result};
use consumer_core::telemetry::init_tracing;
use consumer_core::{ConsumerBuilder, RabbitDriver, load_config};
use tracing::info;

/// Entry point for running a long-lived batch consumer on container hosting
/// services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config from the path given as first argument, or from the
///     `BATCH_CONSUMER_CONFIG` environment variable.
///     Consume the configured queue in batches, logging each batch.
///     Stop gracefully on Ctrl-C: unflushed messages are left to the broker.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load consumer configuration")?;
    config.validate()?;

    let driver = RabbitDriver::new(config.rabbit.clone())?;
    let consumer = ConsumerBuilder::<serde_json::Value>::new()
        .config(config.consumer.clone())
        .driver(driver)
        .batch_output(|batch: Vec<serde_json::Value>| async move {
            info!(size = batch.len(), "received batch");
            for message in &batch {
                info!(%message, "message");
            }
            anyhow::Ok(())
        })
        .build()?;

    consumer.start().await.context("Failed to start consumer")?;
    info!(queue = %config.rabbit.queue, "consumer running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!(metrics = ?consumer.metrics(), "shutting down");
    consumer.stop().await?;
    Ok(())
}
