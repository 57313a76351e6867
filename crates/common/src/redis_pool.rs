use anyhow::Context;
use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager for async operations.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url).context("parsing REDIS_URL")?;
    let manager = ConnectionManager::new(client)
        .await
        .context("connecting to Redis")?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}

/// Connections of one stream consumer.
///
/// `XREADGROUP ... BLOCK` holds `reader` for the whole block window, so acks,
/// group setup and publishes go through `writer`.
pub struct BusConnections {
    pub reader: ConnectionManager,
    pub writer: ConnectionManager,
}

pub async fn open_bus(redis_url: &str) -> anyhow::Result<BusConnections> {
    Ok(BusConnections {
        reader: create_redis_pool(redis_url).await?,
        writer: create_redis_pool(redis_url).await?,
    })
}
