//! Herald callback API binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::shutdown;
use herald_store::PgNotificationStore;

use herald_api::callback::CallbackService;
use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=info,herald_store=info,tower_http=info")
        }))
        .json()
        .init();

    tracing::info!("Starting Herald callback API...");

    let config = AppConfig::from_env()?;

    let pool = db::connect(&config).await?;

    let redis = redis::Client::open(config.redis_url.as_str())?;

    let store = PgNotificationStore::new(pool.clone(), config.stale_window());
    let callbacks = Arc::new(CallbackService::new(Arc::new(store), &config));

    if config.is_production() && config.twilio_auth_token.is_none() {
        anyhow::bail!("TWILIO_AUTH_TOKEN is required in production to verify callbacks");
    }

    let port = config.api_port;
    let state = AppState::new(pool, redis, config, callbacks);

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Callback API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::signal())
        .await?;

    tracing::info!("Herald callback API stopped.");
    Ok(())
}
