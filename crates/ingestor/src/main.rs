use std::sync::Arc;

use herald_common::bus::{RedisStreamConsumer, RedisStreamPublisher, ensure_consumer_group};
use herald_common::config::{AppConfig, REQUESTS_CONSUMER_GROUP};
use herald_common::redis_pool::{BusConnections, open_bus};
use herald_common::{db, shutdown};
use herald_ingestor::batcher::{BatcherSettings, NotificationBatcher};
use herald_store::PgNotificationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_ingestor=info,herald_store=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald ingestor starting...");

    let config = AppConfig::from_env()?;

    let pool = db::connect(&config).await?;

    let BusConnections { reader, mut writer } = open_bus(&config.redis_url).await?;
    ensure_consumer_group(&mut writer, &config.requests_stream, REQUESTS_CONSUMER_GROUP).await?;

    let source = RedisStreamConsumer::new(
        reader,
        writer.clone(),
        &config.requests_stream,
        REQUESTS_CONSUMER_GROUP,
        &config.consumer_name,
        config.bus_block_ms,
    )
    .with_claim(config.claim_policy());
    let publisher =
        RedisStreamPublisher::new(writer, &config.tasks_stream, config.task_publish_batch_size);
    let store = PgNotificationStore::new(pool, config.stale_window());

    let batcher = NotificationBatcher::new(
        Arc::new(source),
        Arc::new(store),
        Arc::new(publisher),
        BatcherSettings::from_config(&config),
    );

    tracing::info!(
        stream = %config.requests_stream,
        batch_size = config.ingest_batch_size,
        flush_interval_ms = config.ingest_flush_interval_ms,
        "Starting notification batcher"
    );

    let cancel = shutdown::cancel_on_signal();
    if let Err(e) = batcher.run(cancel).await {
        tracing::error!(error = %e, "Final flush failed, buffered requests stay unacknowledged");
        return Err(e.into());
    }

    tracing::info!("Herald ingestor stopped.");
    Ok(())
}
