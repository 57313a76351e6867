//! Delivery-status callback API.
//!
//! Endpoints:
//! - POST /callback?notification_id=<uuid> - provider delivery report (form-encoded)
//! - GET  /health - Postgres and Redis reachability

pub mod callback;
pub mod middleware;
pub mod routes;
pub mod state;
