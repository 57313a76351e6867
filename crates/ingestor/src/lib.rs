//! Ingestion Batcher: expands notification requests into rows and delivery tasks.

pub mod batcher;
