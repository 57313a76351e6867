//! PostgreSQL implementation of the Notification Store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{Notification, NotificationStatus};

use crate::NotificationStore;
use crate::row::{NotificationRow, into_notifications};

/// Statuses a writer may still move away from.
const OPEN_STATUSES: &str = "('pending', 'in_flight')";

#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
    stale_window: Duration,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool, stale_window: Duration) -> Self {
        Self { pool, stale_window }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a guarded update touched no row.
    async fn rejected_write(&self, id: Uuid) -> AppError {
        match self.get_by_id(id).await {
            Ok(existing) if existing.status.is_terminal() => AppError::TerminalStatus {
                id,
                status: existing.status,
            },
            Ok(existing) => AppError::Internal(format!(
                "Notification {} changed concurrently (now {})",
                id, existing.status
            )),
            Err(e) => e,
        }
    }
}

/// Render the staging payload for `COPY ... (FORMAT csv)`.
fn encode_copy_payload(notifications: &[Notification]) -> AppResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(Vec::with_capacity(notifications.len() * 96));

    for n in notifications {
        writer
            .write_record([
                n.id.to_string().as_str(),
                n.user_id.to_string().as_str(),
                n.text.as_str(),
                n.recipient_phone.as_str(),
            ])
            .map_err(|e| AppError::Internal(format!("Failed to encode copy row: {}", e)))?;
    }

    writer
        .into_inner()
        .map_err(|e| AppError::Internal(format!("Failed to flush copy payload: {}", e)))
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create_many(&self, notifications: &[Notification]) -> AppResult<u64> {
        if notifications.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let payload = encode_copy_payload(notifications)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TEMP TABLE notifications_staging (
                id UUID NOT NULL,
                user_id BIGINT NOT NULL,
                text TEXT NOT NULL,
                recipient_phone TEXT NOT NULL
            ) ON COMMIT DROP
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let mut copy = tx
            .copy_in_raw(
                "COPY notifications_staging (id, user_id, text, recipient_phone) FROM STDIN WITH (FORMAT csv)",
            )
            .await?;
        let sent = copy.send(payload).await.map(|_| ());
        if let Err(e) = sent {
            if let Err(abort_err) = copy.abort("staging payload rejected").await {
                tracing::warn!(error = %abort_err, "Failed to abort COPY");
            }
            return Err(e.into());
        }
        let staged = copy.finish().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO notifications
                (id, user_id, text, recipient_phone, status, attempts, next_run_at, created_at, updated_at)
            SELECT id, user_id, text, recipient_phone, 'in_flight', 1, NOW(), NOW(), NOW()
            FROM notifications_staging
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        tracing::debug!(
            staged,
            inserted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Notifications bulk inserted"
        );

        Ok(inserted)
    }

    async fn get_by_id(&self, id: Uuid) -> AppResult<Notification> {
        let row: NotificationRow = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::notification_not_found(id))?;

        row.try_into()
    }

    async fn change_status(&self, id: Uuid, status: NotificationStatus) -> AppResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE notifications SET status = $2, updated_at = NOW() WHERE id = $1 AND status IN {}",
            OPEN_STATUSES
        ))
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_write(id).await);
        }
        Ok(())
    }

    async fn lease_due_and_stale(&self, limit: i64) -> AppResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            WITH claimed AS (
                SELECT id
                FROM notifications
                WHERE (status = 'pending' AND next_run_at <= NOW())
                   OR (status = 'in_flight' AND updated_at <= NOW() - make_interval(secs => $2))
                ORDER BY next_run_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE notifications n
            SET status = 'in_flight',
                attempts = n.attempts + 1,
                updated_at = NOW()
            FROM claimed
            WHERE n.id = claimed.id
            RETURNING n.*
            "#,
        )
        .bind(limit)
        .bind(self.stale_window.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        into_notifications(rows)
    }

    async fn reschedule(&self, id: Uuid, next_run_at: DateTime<Utc>) -> AppResult<Notification> {
        let row: Option<NotificationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE notifications
            SET status = 'pending', next_run_at = $2, updated_at = NOW()
            WHERE id = $1 AND status IN {}
            RETURNING *
            "#,
            OPEN_STATUSES
        ))
        .bind(id)
        .bind(next_run_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.rejected_write(id).await),
        }
    }

    async fn mark_failed(&self, id: Uuid) -> AppResult<Notification> {
        let row: Option<NotificationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE notifications
            SET status = 'failed', updated_at = NOW()
            WHERE id = $1 AND status IN {}
            RETURNING *
            "#,
            OPEN_STATUSES
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.rejected_write(id).await),
        }
    }
}
