//! Shared building blocks for the Herald SMS delivery services.

pub mod bus;
pub mod config;
pub mod db;
pub mod deadline;
pub mod error;
pub mod redis_pool;
pub mod shutdown;
pub mod types;
