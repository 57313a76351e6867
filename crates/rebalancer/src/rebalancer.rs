use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use herald_common::bus::MessagePublisher;
use herald_common::config::AppConfig;
use herald_common::deadline::bounded;
use herald_common::error::{AppError, AppResult};
use herald_common::types::SendNotificationTask;
use herald_store::NotificationStore;

/// Periodic claimer of due `pending` rows and stale `in_flight` leases.
///
/// Safe to run as several instances: claiming skips rows another instance has locked.
pub struct Rebalancer {
    store: Arc<dyn NotificationStore>,
    publisher: Arc<dyn MessagePublisher>,
    batch_size: i64,
    interval: Duration,
    context_timeout: Duration,
}

impl Rebalancer {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            batch_size: config.rebalancer_batch_size,
            interval: config.rebalancer_interval(),
            context_timeout: config.context_timeout(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Tick until cancelled. Ticks never overlap; a running tick is finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Rebalancer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.rebalance().await {
                        tracing::error!(error = %e, "Rebalance tick failed, retrying next interval");
                    }
                }
            }
        }
    }

    /// One tick: claim, then publish a task per claimed row. Returns the number claimed.
    ///
    /// Rows claimed but not published stay `in_flight` and are reclaimed once stale.
    pub async fn rebalance(&self) -> AppResult<usize> {
        let start = Instant::now();

        let claimed = bounded(
            self.context_timeout,
            "lease_due_and_stale",
            self.store.lease_due_and_stale(self.batch_size),
        )
        .await?;

        if claimed.is_empty() {
            tracing::debug!("No due or stale notifications");
            return Ok(0);
        }

        let payloads = claimed
            .iter()
            .map(|n| serde_json::to_vec(&SendNotificationTask::from(n)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::from)?;

        bounded(
            self.context_timeout,
            "publish",
            self.publisher.publish(payloads),
        )
        .await?;

        tracing::info!(
            claimed = claimed.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Republished due and stale notifications"
        );
        Ok(claimed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_common::bus::memory::MemoryBus;
    use herald_common::types::{Notification, NotificationStatus};
    use herald_store::memory::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryBus>, Rebalancer) {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(300)));
        let bus = Arc::new(MemoryBus::new());
        let rebalancer = Rebalancer::new(store.clone(), bus.clone(), &AppConfig::for_tests());
        (store, bus, rebalancer)
    }

    fn published_tasks(bus: &MemoryBus) -> Vec<SendNotificationTask> {
        bus.published()
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_empty_tick_is_silent() {
        let (_, bus, rebalancer) = setup();
        assert_eq!(rebalancer.rebalance().await.unwrap(), 0);
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimed() {
        let (store, bus, rebalancer) = setup();
        let n = Notification::new(1, "Hi", "+15550001");
        store.insert(n.clone());
        store.set_updated_at(n.id, Utc::now() - chrono::Duration::minutes(10));

        assert_eq!(rebalancer.rebalance().await.unwrap(), 1);

        let row = store.get(n.id).unwrap();
        assert_eq!(row.status, NotificationStatus::InFlight);
        assert_eq!(row.attempts, 2);
        assert!(Utc::now() - row.updated_at < chrono::Duration::seconds(5));

        let tasks = published_tasks(&bus);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, n.id);
        assert_eq!(tasks[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_due_pending_is_claimed_up_to_batch_size() {
        let (store, bus, rebalancer) = setup();
        let rebalancer = rebalancer.with_batch_size(2);
        for i in 0..3 {
            let mut n = Notification::new(1, "Hi", format!("+1555000{}", i));
            n.status = NotificationStatus::Pending;
            n.next_run_at = Utc::now() - chrono::Duration::seconds(1);
            store.insert(n);
        }

        assert_eq!(rebalancer.rebalance().await.unwrap(), 2);
        assert_eq!(rebalancer.rebalance().await.unwrap(), 1);
        assert_eq!(rebalancer.rebalance().await.unwrap(), 0);
        assert_eq!(bus.published().len(), 3);
    }

    #[tokio::test]
    async fn test_store_failure_abandons_tick() {
        let (store, bus, rebalancer) = setup();
        store.fail_next(1);

        assert!(rebalancer.rebalance().await.is_err());
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_rows_claimed() {
        let (store, bus, rebalancer) = setup();
        let mut n = Notification::new(1, "Hi", "+15550001");
        n.status = NotificationStatus::Pending;
        n.next_run_at = Utc::now() - chrono::Duration::seconds(1);
        store.insert(n.clone());
        bus.fail_next_publishes(1);

        assert!(rebalancer.rebalance().await.is_err());

        // Claimed under a fresh lease; only the stale window brings it back
        let row = store.get(n.id).unwrap();
        assert_eq!(row.status, NotificationStatus::InFlight);
        assert_eq!(rebalancer.rebalance().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (store, bus, rebalancer) = setup();
        let n = Notification::new(1, "Hi", "+15550001");
        store.insert(n.clone());
        store.set_updated_at(n.id, Utc::now() - chrono::Duration::minutes(10));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let running = tokio::spawn(async move { rebalancer.run(stop).await });

        for _ in 0..100 {
            if !bus.published().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(bus.published().len(), 1);
    }
}
