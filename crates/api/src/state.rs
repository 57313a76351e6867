//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::config::AppConfig;
use sqlx::PgPool;

use crate::callback::CallbackService;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Connections are opened per health probe
    pub redis: redis::Client,
    pub config: AppConfig,
    pub callbacks: Arc<CallbackService>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        redis: redis::Client,
        config: AppConfig,
        callbacks: Arc<CallbackService>,
    ) -> Self {
        Self {
            pool,
            redis,
            config,
            callbacks,
        }
    }
}
