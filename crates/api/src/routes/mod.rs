pub mod callback;
pub mod health;

use axum::Router;

use crate::middleware::signature::verify_provider_signature;
use crate::state::AppState;

/// Build the complete API router with all routes.
///
/// Provider signatures are only checked in production.
pub fn create_router(state: AppState) -> Router {
    let callbacks = if state.config.is_production() {
        callback::router().route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            verify_provider_signature,
        ))
    } else {
        callback::router()
    };

    Router::new()
        .merge(health::router())
        .merge(callbacks)
        .with_state(state)
}
