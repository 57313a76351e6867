//! Delivery-status state machine driven by provider callbacks.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::deadline::bounded;
use herald_common::error::{AppError, AppResult};
use herald_common::types::NotificationStatus;
use herald_store::NotificationStore;

/// Provider statuses the handler acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    Delivered,
    Undelivered,
    /// Intermediate or unknown statuses (`queued`, `sending`, ...)
    Other,
}

impl ReportedStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "delivered" | "sent" => ReportedStatus::Delivered,
            "failed" | "undelivered" => ReportedStatus::Undelivered,
            _ => ReportedStatus::Other,
        }
    }
}

/// What a callback did to the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Sent,
    /// Back to `pending` for the rebalancer
    Requeued,
    Failed,
    Ignored,
}

pub struct CallbackService {
    store: Arc<dyn NotificationStore>,
    max_attempts: i32,
    context_timeout: Duration,
}

impl CallbackService {
    pub fn new(store: Arc<dyn NotificationStore>, config: &AppConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts,
            context_timeout: config.context_timeout(),
        }
    }

    /// Apply one delivery report. Re-applying the same report gives the same state.
    pub async fn process(&self, notification_id: &str, status: &str) -> AppResult<CallbackOutcome> {
        let reported = ReportedStatus::parse(status);
        if reported == ReportedStatus::Other {
            tracing::debug!(notification_id, status, "Ignoring intermediate provider status");
            return Ok(CallbackOutcome::Ignored);
        }

        let id = Uuid::parse_str(notification_id.trim()).map_err(|_| {
            AppError::Validation(format!("Invalid notification id '{}'", notification_id))
        })?;
        let timeout = self.context_timeout;

        if reported == ReportedStatus::Delivered {
            bounded(
                timeout,
                "change_status",
                self.store.change_status(id, NotificationStatus::Sent),
            )
            .await?;
            tracing::info!(notification_id = %id, "Notification delivered");
            return Ok(CallbackOutcome::Sent);
        }

        let current = bounded(timeout, "get_by_id", self.store.get_by_id(id)).await?;
        if current.status.is_terminal() {
            return Err(AppError::TerminalStatus {
                id,
                status: current.status,
            });
        }

        if current.attempts < self.max_attempts {
            bounded(
                timeout,
                "change_status",
                self.store.change_status(id, NotificationStatus::Pending),
            )
            .await?;
            tracing::info!(notification_id = %id, attempts = current.attempts, "Delivery failed, requeued");
            Ok(CallbackOutcome::Requeued)
        } else {
            bounded(timeout, "mark_failed", self.store.mark_failed(id)).await?;
            tracing::warn!(notification_id = %id, attempts = current.attempts, "Delivery failed, attempts exhausted");
            Ok(CallbackOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::Notification;
    use herald_store::memory::MemoryStore;

    fn service(store: Arc<MemoryStore>) -> CallbackService {
        let mut config = AppConfig::for_tests();
        config.max_attempts = 3;
        CallbackService::new(store, &config)
    }

    fn seeded(attempts: i32) -> (Arc<MemoryStore>, Notification) {
        let store = Arc::new(MemoryStore::default());
        let mut n = Notification::new(1, "Hi", "+15550001");
        n.attempts = attempts;
        store.insert(n.clone());
        (store, n)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ReportedStatus::parse("delivered"), ReportedStatus::Delivered);
        assert_eq!(ReportedStatus::parse("sent"), ReportedStatus::Delivered);
        assert_eq!(ReportedStatus::parse("Undelivered"), ReportedStatus::Undelivered);
        assert_eq!(ReportedStatus::parse("failed"), ReportedStatus::Undelivered);
        assert_eq!(ReportedStatus::parse("queued"), ReportedStatus::Other);
        assert_eq!(ReportedStatus::parse(""), ReportedStatus::Other);
    }

    #[tokio::test]
    async fn test_delivered_marks_sent() {
        let (store, n) = seeded(1);
        let outcome = service(store.clone())
            .process(&n.id.to_string(), "delivered")
            .await
            .unwrap();

        assert_eq!(outcome, CallbackOutcome::Sent);
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_failure_with_budget_requeues() {
        let (store, n) = seeded(2);
        let outcome = service(store.clone())
            .process(&n.id.to_string(), "undelivered")
            .await
            .unwrap();

        assert_eq!(outcome, CallbackOutcome::Requeued);
        let row = store.get(n.id).unwrap();
        assert_eq!(row.status, NotificationStatus::Pending);
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn test_failure_without_budget_fails() {
        let (store, n) = seeded(3);
        let outcome = service(store.clone())
            .process(&n.id.to_string(), "failed")
            .await
            .unwrap();

        assert_eq!(outcome, CallbackOutcome::Failed);
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Failed);
    }

    #[tokio::test]
    async fn test_repeated_callback_is_idempotent() {
        let (store, n) = seeded(1);
        let svc = service(store.clone());
        let id = n.id.to_string();

        svc.process(&id, "delivered").await.unwrap();
        let again = svc.process(&id, "delivered").await;

        assert!(matches!(again, Err(AppError::TerminalStatus { .. })));
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_late_failure_does_not_regress_sent() {
        let (store, n) = seeded(1);
        let svc = service(store.clone());
        let id = n.id.to_string();

        svc.process(&id, "delivered").await.unwrap();
        let late = svc.process(&id, "undelivered").await;

        assert!(matches!(
            late,
            Err(AppError::TerminalStatus { status: NotificationStatus::Sent, .. })
        ));
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_unknown_status_is_ignored() {
        let (store, n) = seeded(1);
        let outcome = service(store.clone())
            .process("not-a-uuid", "sending")
            .await
            .unwrap();

        assert_eq!(outcome, CallbackOutcome::Ignored);
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::InFlight);
    }

    #[tokio::test]
    async fn test_invalid_id_is_validation_error() {
        let (store, _) = seeded(1);
        let result = service(store).process("not-a-uuid", "delivered").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (store, _) = seeded(1);
        let result = service(store)
            .process(&Uuid::new_v4().to_string(), "failed")
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
