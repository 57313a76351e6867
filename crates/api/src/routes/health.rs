//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let timeout = state.config.context_timeout();

    let postgres = tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&state.pool))
        .await
        .map_err(|_| "timed out".to_string())
        .and_then(|r| r.map(|_| ()).map_err(|e| e.to_string()));

    let redis = tokio::time::timeout(timeout, ping(&state.redis))
        .await
        .map_err(|_| "timed out".to_string())
        .and_then(|r| r.map_err(|e| e.to_string()));

    let healthy = postgres.is_ok() && redis.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    if let Err(e) = &postgres {
        tracing::warn!(error = %e, "Postgres health check failed");
    }
    if let Err(e) = &redis {
        tracing::warn!(error = %e, "Redis health check failed");
    }

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "herald-api",
            "version": env!("CARGO_PKG_VERSION"),
            "postgres": describe(&postgres),
            "redis": describe(&redis),
        })),
    )
}

async fn ping(client: &redis::Client) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}

fn describe(check: &Result<(), String>) -> String {
    match check {
        Ok(()) => "ok".to_string(),
        Err(e) => e.clone(),
    }
}
