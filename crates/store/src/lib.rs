//! Notification Store: the persistence contract shared by every Herald service.

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod postgres;
mod row;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::error::AppResult;
use herald_common::types::{Notification, NotificationStatus};

pub use postgres::PgNotificationStore;

/// Persistence operations behind the delivery pipeline.
///
/// Status writes never touch a row that is already `sent` or `failed`; such a write
/// fails with `AppError::TerminalStatus`. A write or lookup against an id that does
/// not exist fails with `AppError::NotFound`.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert every notification as `in_flight` with `attempts = 1`. All or nothing.
    async fn create_many(&self, notifications: &[Notification]) -> AppResult<u64>;

    async fn get_by_id(&self, id: Uuid) -> AppResult<Notification>;

    /// Set `status` and bump `updated_at`.
    async fn change_status(&self, id: Uuid, status: NotificationStatus) -> AppResult<()>;

    /// Claim up to `limit` due `pending` rows and stale `in_flight` rows.
    ///
    /// Claimed rows come back `in_flight` with `attempts` incremented and a fresh lease.
    /// Concurrent callers never receive the same row.
    async fn lease_due_and_stale(&self, limit: i64) -> AppResult<Vec<Notification>>;

    /// Put the notification back to `pending`, eligible again at `next_run_at`.
    async fn reschedule(&self, id: Uuid, next_run_at: DateTime<Utc>) -> AppResult<Notification>;

    async fn mark_failed(&self, id: Uuid) -> AppResult<Notification>;
}
