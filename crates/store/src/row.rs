use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Notification, NotificationStatus};

/// `notifications` row as stored; `status` is plain text guarded by a CHECK constraint.
#[derive(Debug, FromRow)]
pub(crate) struct NotificationRow {
    pub id: Uuid,
    pub user_id: i64,
    pub text: String,
    pub recipient_phone: String,
    pub status: String,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let status: NotificationStatus = row.status.parse().map_err(AppError::Internal)?;

        Ok(Notification {
            id: row.id,
            user_id: row.user_id,
            text: row.text,
            recipient_phone: row.recipient_phone,
            status,
            attempts: row.attempts,
            next_run_at: row.next_run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) fn into_notifications(rows: Vec<NotificationRow>) -> Result<Vec<Notification>, AppError> {
    rows.into_iter().map(Notification::try_from).collect()
}
