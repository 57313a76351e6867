//! Message bus contract shared by every service.
//!
//! A source hands out messages one at a time and only forgets them once they are
//! committed; anything fetched but never committed is delivered again. Publishing
//! is fire-and-forget from the caller's point of view.

mod redis_streams;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

use async_trait::async_trait;

use crate::error::AppResult;

pub use redis_streams::{
    ClaimPolicy, RedisStreamConsumer, RedisStreamPublisher, ensure_consumer_group,
};

/// Bus-assigned identifier used to acknowledge a message.
pub type MessageId = String;

/// A raw message as fetched from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait up to the source's block window for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time; callers loop and check for cancellation.
    async fn fetch(&self) -> AppResult<Option<BusMessage>>;

    /// Acknowledge messages so they are never delivered again.
    async fn commit(&self, ids: &[MessageId]) -> AppResult<()>;
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Append payloads to the stream in order.
    async fn publish(&self, payloads: Vec<Vec<u8>>) -> AppResult<()>;
}
