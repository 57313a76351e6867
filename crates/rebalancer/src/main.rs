use std::sync::Arc;

use herald_common::bus::RedisStreamPublisher;
use herald_common::config::AppConfig;
use herald_common::redis_pool::create_redis_pool;
use herald_common::{db, shutdown};
use herald_rebalancer::rebalancer::Rebalancer;
use herald_store::PgNotificationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_rebalancer=info,herald_store=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald rebalancer starting...");

    let config = AppConfig::from_env()?;

    let pool = db::connect(&config).await?;

    let redis = create_redis_pool(&config.redis_url).await?;
    let publisher =
        RedisStreamPublisher::new(redis, &config.tasks_stream, config.task_publish_batch_size);
    let store = PgNotificationStore::new(pool, config.stale_window());

    let rebalancer = Rebalancer::new(Arc::new(store), Arc::new(publisher), &config);

    let cancel = shutdown::cancel_on_signal();
    rebalancer.run(cancel).await;

    tracing::info!("Herald rebalancer stopped.");
    Ok(())
}
