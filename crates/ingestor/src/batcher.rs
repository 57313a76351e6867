//! Micro-batching consumer for the notification request stream.
//!
//! One loop owns the buffer. It reacts to three events: a message handed over by the
//! fetch task, the flush ticker, and cancellation. Rows are persisted before their
//! delivery tasks are published and before the source messages are acknowledged, so a
//! crash at any point leaves either an unacknowledged request (redelivered) or an
//! `in_flight` row (reclaimed once its lease goes stale).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use herald_common::bus::{BusMessage, MessageId, MessagePublisher, MessageSource};
use herald_common::config::AppConfig;
use herald_common::deadline::bounded;
use herald_common::error::AppResult;
use herald_common::types::{Notification, NotificationRequest, SendNotificationTask};
use herald_store::NotificationStore;

/// Pause after a failed fetch before asking the bus again.
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BatcherSettings {
    /// Buffered notifications that trigger a flush
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Bound on each store and bus call
    pub context_timeout: Duration,
}

impl BatcherSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.ingest_batch_size.max(1),
            flush_interval: config.ingest_flush_interval(),
            context_timeout: config.context_timeout(),
        }
    }
}

pub struct NotificationBatcher {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn NotificationStore>,
    publisher: Arc<dyn MessagePublisher>,
    settings: BatcherSettings,
    buffer: Vec<Notification>,
    /// Requests fully expanded into the buffer, acknowledged on the next successful flush
    unacked: Vec<MessageId>,
}

impl NotificationBatcher {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn NotificationStore>,
        publisher: Arc<dyn MessagePublisher>,
        settings: BatcherSettings,
    ) -> Self {
        Self {
            source,
            store,
            publisher,
            settings,
            buffer: Vec::new(),
            unacked: Vec::new(),
        }
    }

    /// Consume until `cancel` fires, then flush whatever is buffered.
    ///
    /// Only the result of the final flush is returned; failures along the way are
    /// logged and retried by the next trigger.
    pub async fn run(mut self, cancel: CancellationToken) -> AppResult<()> {
        let fetch_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(1);
        let fetcher = tokio::spawn(fetch_loop(self.source.clone(), tx, fetch_cancel.clone()));

        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        tracing::error!(error = %e, buffered = self.buffer.len(), "Timed flush failed");
                    }
                }
                received = rx.recv() => match received {
                    Some(msg) => {
                        if let Err(e) = self.handle(msg).await {
                            tracing::error!(error = %e, buffered = self.buffer.len(), "Failed to handle notification request");
                        }
                    }
                    None => break,
                },
            }
        }

        fetch_cancel.cancel();
        if let Err(e) = fetcher.await {
            tracing::error!(error = %e, "Fetch task panicked");
        }

        // Already fetched, so it goes out with the final flush
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            if let Err(e) = self.handle(msg).await {
                tracing::error!(error = %e, buffered = self.buffer.len(), "Failed to handle notification request");
            }
        }

        tracing::info!(buffered = self.buffer.len(), "Flushing before shutdown");
        self.flush().await
    }

    /// Expand one request into the buffer, flushing each time the threshold is hit.
    async fn handle(&mut self, msg: BusMessage) -> AppResult<()> {
        let parsed = serde_json::from_slice::<NotificationRequest>(&msg.payload)
            .map_err(|e| e.to_string())
            .and_then(|request| request.validate().map(|()| request));
        let request = match parsed {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(message_id = %msg.id, error = %e, "Malformed notification request, skipping");
                bounded(
                    self.settings.context_timeout,
                    "commit",
                    self.source.commit(std::slice::from_ref(&msg.id)),
                )
                .await?;
                return Ok(());
            }
        };

        let mut flush_error = None;
        for contact in request.contacts {
            self.buffer.push(Notification::new(
                request.user_id,
                request.template.as_str(),
                contact.phone,
            ));

            // After one failure keep buffering; the next trigger retries
            if flush_error.is_none() && self.buffer.len() >= self.settings.batch_size {
                flush_error = self.flush().await.err();
            }
        }
        self.unacked.push(msg.id);

        match flush_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Persist the buffer, publish its delivery tasks and acknowledge the requests behind it.
    ///
    /// On a persist failure nothing is cleared or acknowledged.
    async fn flush(&mut self) -> AppResult<()> {
        if self.buffer.is_empty() && self.unacked.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let timeout = self.settings.context_timeout;

        if !self.buffer.is_empty() {
            bounded(timeout, "create_many", self.store.create_many(&self.buffer)).await?;
            self.publish_tasks().await;
        }

        let flushed = self.buffer.len();
        self.buffer.clear();

        let acked = std::mem::take(&mut self.unacked);
        if let Err(e) = bounded(timeout, "commit", self.source.commit(&acked)).await {
            tracing::error!(error = %e, messages = acked.len(), "Failed to acknowledge flushed requests");
        }

        tracing::info!(
            notifications = flushed,
            messages = acked.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Flushed notification batch"
        );
        Ok(())
    }

    /// Rows that miss their task here stay `in_flight` until the rebalancer reclaims them.
    async fn publish_tasks(&self) {
        let mut payloads = Vec::with_capacity(self.buffer.len());
        for n in &self.buffer {
            match serde_json::to_vec(&SendNotificationTask::from(n)) {
                Ok(payload) => payloads.push(payload),
                Err(e) => {
                    tracing::error!(notification_id = %n.id, error = %e, "Failed to encode delivery task")
                }
            }
        }

        let count = payloads.len();
        let published = bounded(
            self.settings.context_timeout,
            "publish",
            self.publisher.publish(payloads),
        )
        .await;
        if let Err(e) = published {
            tracing::error!(error = %e, tasks = count, "Failed to publish delivery tasks");
        }
    }
}

/// Hand messages to the batch loop until cancelled or the loop goes away.
async fn fetch_loop(
    source: Arc<dyn MessageSource>,
    tx: mpsc::Sender<BusMessage>,
    cancel: CancellationToken,
) {
    loop {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            fetched = source.fetch() => fetched,
        };

        match fetched {
            Ok(Some(msg)) => {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(msg) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch notification request");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(FETCH_RETRY_DELAY) => {}
                }
            }
        }
    }
}
