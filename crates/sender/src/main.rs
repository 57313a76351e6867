use std::sync::Arc;

use herald_common::bus::{RedisStreamConsumer, ensure_consumer_group};
use herald_common::config::{AppConfig, TASKS_CONSUMER_GROUP};
use herald_common::redis_pool::{BusConnections, open_bus};
use herald_common::{db, shutdown};
use herald_sender::gateway_from_config;
use herald_sender::policy::DeliveryPolicy;
use herald_sender::worker::DeliveryWorker;
use herald_store::PgNotificationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_sender=info,herald_store=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald sender starting...");

    let config = AppConfig::from_env()?;

    let pool = db::connect(&config).await?;

    let BusConnections { reader, mut writer } = open_bus(&config.redis_url).await?;
    ensure_consumer_group(&mut writer, &config.tasks_stream, TASKS_CONSUMER_GROUP).await?;

    let source = RedisStreamConsumer::new(
        reader,
        writer,
        &config.tasks_stream,
        TASKS_CONSUMER_GROUP,
        &config.consumer_name,
        config.bus_block_ms,
    )
    .with_claim(config.claim_policy())
    .with_redelivery(config.task_redelivery_interval());

    let store = PgNotificationStore::new(pool, config.stale_window());
    let gateway = gateway_from_config(&config)?;

    let worker = DeliveryWorker::new(
        Arc::new(source),
        Arc::new(store),
        gateway,
        DeliveryPolicy::from_config(&config),
        config.context_timeout(),
    );

    let cancel = shutdown::cancel_on_signal();
    worker.run(cancel).await;

    tracing::info!("Herald sender stopped.");
    Ok(())
}
