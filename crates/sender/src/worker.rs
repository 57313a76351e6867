//! Consumer loop for the delivery task stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use herald_common::bus::{BusMessage, MessageSource};
use herald_common::deadline::bounded;
use herald_common::error::{AppError, AppResult};
use herald_common::types::SendNotificationTask;
use herald_store::NotificationStore;

use crate::gateway::{SendError, SendErrorKind, SmsGateway};
use crate::policy::{DeliveryPolicy, RetryDecision};

const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What happens to the bus message once a task is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave unacknowledged so the bus delivers it again
    Retain,
}

pub struct DeliveryWorker {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn NotificationStore>,
    gateway: Arc<dyn SmsGateway>,
    policy: DeliveryPolicy,
    context_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn NotificationStore>,
        gateway: Arc<dyn SmsGateway>,
        policy: DeliveryPolicy,
        context_timeout: Duration,
    ) -> Self {
        Self {
            source,
            store,
            gateway,
            policy,
            context_timeout,
        }
    }

    /// Consume tasks until cancelled. A task already being processed is finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            max_attempts = self.policy.max_attempts,
            backoff_base_ms = self.policy.backoff_base.as_millis() as u64,
            "Delivery worker started"
        );

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.source.fetch() => fetched,
            };

            match fetched {
                Ok(Some(msg)) => self.process(msg).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Failed to fetch delivery task");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    /// Handle one message and acknowledge it unless it must be redelivered.
    pub async fn process(&self, msg: BusMessage) {
        if self.handle(&msg).await == Disposition::Retain {
            return;
        }

        let committed = bounded(
            self.context_timeout,
            "commit",
            self.source.commit(std::slice::from_ref(&msg.id)),
        )
        .await;
        if let Err(e) = committed {
            tracing::error!(message_id = %msg.id, error = %e, "Failed to acknowledge delivery task");
        }
    }

    pub async fn handle(&self, msg: &BusMessage) -> Disposition {
        let task: SendNotificationTask = match serde_json::from_slice(&msg.payload) {
            Ok(task) => task,
            Err(e) => {
                tracing::error!(message_id = %msg.id, error = %e, "Malformed delivery task, skipping");
                return Disposition::Ack;
            }
        };

        match self
            .gateway
            .send_sms(&task.recipient_phone, &task.text, task.id)
            .await
        {
            Ok(()) => {
                tracing::info!(notification_id = %task.id, attempts = task.attempts, "SMS accepted by provider");
                Disposition::Ack
            }
            Err(err) => self.on_send_failure(&task, err).await,
        }
    }

    async fn on_send_failure(&self, task: &SendNotificationTask, err: SendError) -> Disposition {
        match err.kind {
            SendErrorKind::Retryable => tracing::info!(
                notification_id = %task.id,
                attempts = task.attempts,
                code = ?err.code,
                error = %err,
                "Retryable send failure"
            ),
            SendErrorKind::Permanent => tracing::warn!(
                notification_id = %task.id,
                attempts = task.attempts,
                code = ?err.code,
                error = %err,
                "Permanent send failure"
            ),
        }

        match self.apply_decision(task).await {
            Ok(()) => Disposition::Ack,
            Err(AppError::TerminalStatus { status, .. }) => {
                tracing::debug!(notification_id = %task.id, %status, "Notification already final");
                Disposition::Ack
            }
            Err(AppError::NotFound(msg)) => {
                tracing::error!(notification_id = %task.id, error = %msg, "Delivery task has no stored notification");
                Disposition::Ack
            }
            Err(e) => {
                tracing::error!(notification_id = %task.id, error = %e, "Failed to record send failure, task will be redelivered");
                Disposition::Retain
            }
        }
    }

    async fn apply_decision(&self, task: &SendNotificationTask) -> AppResult<()> {
        match self.policy.decide(task.attempts) {
            RetryDecision::Reschedule(delay) => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| AppError::Internal(format!("backoff out of range: {}", e)))?;
                let next_run_at = Utc::now() + delay;
                bounded(
                    self.context_timeout,
                    "reschedule",
                    self.store.reschedule(task.id, next_run_at),
                )
                .await?;
                tracing::info!(notification_id = %task.id, attempts = task.attempts, %next_run_at, "Notification rescheduled");
            }
            RetryDecision::Fail => {
                bounded(self.context_timeout, "mark_failed", self.store.mark_failed(task.id)).await?;
                tracing::warn!(notification_id = %task.id, attempts = task.attempts, "Notification failed after final attempt");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use herald_common::bus::memory::MemoryBus;
    use herald_common::types::{Notification, NotificationStatus};
    use herald_store::memory::MemoryStore;
    use uuid::Uuid;

    /// Replays scripted outcomes, then succeeds.
    #[derive(Default)]
    struct ScriptedGateway {
        outcomes: Mutex<VecDeque<Result<(), SendError>>>,
        sent: Mutex<Vec<Uuid>>,
    }

    impl ScriptedGateway {
        fn failing(errors: Vec<SendError>) -> Self {
            Self {
                outcomes: Mutex::new(errors.into_iter().map(Err).collect()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SmsGateway for ScriptedGateway {
        async fn send_sms(&self, _to: &str, _body: &str, id: Uuid) -> Result<(), SendError> {
            self.sent.lock().unwrap().push(id);
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    struct Harness {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        gateway: Arc<ScriptedGateway>,
        worker: DeliveryWorker,
    }

    fn harness(gateway: ScriptedGateway) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::default());
        let gateway = Arc::new(gateway);
        let worker = DeliveryWorker::new(
            bus.clone(),
            store.clone(),
            gateway.clone(),
            DeliveryPolicy::new(3, Duration::from_secs(1)),
            Duration::from_secs(1),
        );
        Harness {
            bus,
            store,
            gateway,
            worker,
        }
    }

    fn seed(store: &MemoryStore, attempts: i32) -> Notification {
        let mut n = Notification::new(1, "Hi", "+15550001");
        n.attempts = attempts;
        store.insert(n.clone());
        n
    }

    fn task_payload(n: &Notification) -> Vec<u8> {
        serde_json::to_vec(&SendNotificationTask::from(n)).unwrap()
    }

    async fn process_next(h: &Harness) {
        let msg = h.bus.fetch().await.unwrap().unwrap();
        h.worker.process(msg).await;
    }

    #[tokio::test]
    async fn test_success_acks_without_store_write() {
        let h = harness(ScriptedGateway::default());
        let n = seed(&h.store, 1);
        let id = h.bus.push(task_payload(&n));

        process_next(&h).await;

        assert_eq!(h.bus.acked(), vec![id]);
        assert_eq!(h.store.get(n.id).unwrap().status, NotificationStatus::InFlight);
        assert_eq!(h.gateway.sent.lock().unwrap().as_slice(), &[n.id]);
    }

    #[tokio::test]
    async fn test_retryable_failure_reschedules_with_backoff() {
        let h = harness(ScriptedGateway::failing(vec![SendError::retryable(Some(30001), "queue overflow")]));
        let n = seed(&h.store, 2);
        h.bus.push(task_payload(&n));

        let before = Utc::now();
        process_next(&h).await;

        let row = h.store.get(n.id).unwrap();
        assert_eq!(row.status, NotificationStatus::Pending);
        let delay = row.next_run_at - before;
        assert!(delay >= chrono::Duration::milliseconds(1900) && delay <= chrono::Duration::seconds(3));
        assert_eq!(h.bus.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_follows_attempt_budget() {
        let h = harness(ScriptedGateway::failing(vec![SendError::permanent(Some(21211), "invalid number")]));
        let n = seed(&h.store, 1);
        h.bus.push(task_payload(&n));

        process_next(&h).await;

        assert_eq!(h.store.get(n.id).unwrap().status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn test_last_attempt_marks_failed() {
        let h = harness(ScriptedGateway::failing(vec![SendError::retryable(None, "timeout")]));
        let n = seed(&h.store, 3);
        h.bus.push(task_payload(&n));

        process_next(&h).await;

        assert_eq!(h.store.get(n.id).unwrap().status, NotificationStatus::Failed);
        assert_eq!(h.bus.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_task_unacked() {
        let h = harness(ScriptedGateway::failing(vec![SendError::retryable(None, "timeout")]));
        let n = seed(&h.store, 1);
        let id = h.bus.push(task_payload(&n));
        h.store.fail_next(1);

        process_next(&h).await;

        assert!(h.bus.acked().is_empty());
        assert_eq!(h.bus.pending_ids(), vec![id.clone()]);

        // Redelivered, and this time the provider accepts it
        h.bus.redeliver_pending();
        process_next(&h).await;
        assert_eq!(h.bus.acked(), vec![id]);
        assert_eq!(h.gateway.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_notification_is_acked() {
        let h = harness(ScriptedGateway::failing(vec![SendError::retryable(None, "timeout")]));
        let n = seed(&h.store, 1);
        h.store.change_status(n.id, NotificationStatus::Sent).await.unwrap();
        h.bus.push(task_payload(&n));

        process_next(&h).await;

        assert_eq!(h.store.get(n.id).unwrap().status, NotificationStatus::Sent);
        assert_eq!(h.bus.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_notification_is_acked() {
        let h = harness(ScriptedGateway::failing(vec![SendError::retryable(None, "timeout")]));
        let ghost = Notification::new(1, "Hi", "+15550001");
        h.bus.push(task_payload(&ghost));

        process_next(&h).await;

        assert_eq!(h.bus.acked().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_task_is_acked() {
        let h = harness(ScriptedGateway::default());
        let id = h.bus.push(b"[]".to_vec());

        process_next(&h).await;

        assert_eq!(h.bus.acked(), vec![id]);
        assert!(h.gateway.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_until_cancelled() {
        let h = harness(ScriptedGateway::default());
        for _ in 0..3 {
            let n = seed(&h.store, 1);
            h.bus.push(task_payload(&n));
        }

        let cancel = CancellationToken::new();
        let Harness { bus, worker, .. } = h;
        let stop = cancel.clone();
        let running = tokio::spawn(async move { worker.run(stop).await });

        for _ in 0..100 {
            if bus.acked().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(bus.acked().len(), 3);
    }
}
