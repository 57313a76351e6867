use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};

use super::{BusMessage, MessageId, MessagePublisher, MessageSource};
use crate::error::AppResult;

/// Field under which every stream entry stores its payload.
const PAYLOAD_FIELD: &str = "payload";

/// Pending-list cursor meaning "from the beginning".
const PENDING_START: &str = "0";

/// Entries inspected per `XPENDING` page while looking for abandoned messages.
const CLAIM_PAGE_SIZE: usize = 100;

/// Create the consumer group (and the stream) if they do not exist yet.
pub async fn ensure_consumer_group(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> AppResult<()> {
    let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
    match created {
        Ok(()) => {
            tracing::info!(stream, group, "Created stream consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Consumer-group reader over a Redis stream.
///
/// On start it replays its own pending-entries list, so messages fetched but not
/// acknowledged before a crash come back first. With a redelivery interval set it
/// also re-reads that list periodically, which is how an unacknowledged message is
/// retried without a restart.
///
/// With a claim policy set it also takes over entries other consumers of the group
/// have left unacknowledged for longer than the idle window. That covers instances
/// that crashed or were scaled away and never come back under the same name.
pub struct RedisStreamConsumer {
    /// Dedicated connection; `XREADGROUP ... BLOCK` ties it up for the block window.
    reader: ConnectionManager,
    writer: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    block_ms: usize,
    redelivery_interval: Option<Duration>,
    claim: Option<ClaimPolicy>,
    replaying: AtomicBool,
    pending_cursor: Mutex<String>,
    last_replay: Mutex<Instant>,
    /// `None` until the first sweep, which runs on the first fetch
    last_claim: Mutex<Option<Instant>>,
    claimed: Mutex<VecDeque<BusMessage>>,
}

/// When another consumer's pending entry counts as abandoned, and how often to look.
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    pub min_idle: Duration,
    pub interval: Duration,
}

impl RedisStreamConsumer {
    pub fn new(
        reader: ConnectionManager,
        writer: ConnectionManager,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        block_ms: u64,
    ) -> Self {
        Self {
            reader,
            writer,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block_ms: block_ms as usize,
            redelivery_interval: None,
            claim: None,
            replaying: AtomicBool::new(true),
            pending_cursor: Mutex::new(PENDING_START.to_string()),
            last_replay: Mutex::new(Instant::now()),
            last_claim: Mutex::new(None),
            claimed: Mutex::new(VecDeque::new()),
        }
    }

    /// Take over entries other consumers left idle for longer than `policy.min_idle`.
    pub fn with_claim(mut self, policy: ClaimPolicy) -> Self {
        self.claim = Some(policy);
        self
    }

    /// Periodically replay unacknowledged messages while running.
    pub fn with_redelivery(mut self, interval: Duration) -> Self {
        self.redelivery_interval = Some(interval);
        self
    }

    fn start_replay_if_due(&self) {
        let Some(interval) = self.redelivery_interval else {
            return;
        };
        let mut last = self.last_replay.lock().unwrap_or_else(|e| e.into_inner());
        if last.elapsed() >= interval {
            *last = Instant::now();
            self.replaying.store(true, Ordering::Release);
        }
    }

    fn claim_due(&self) -> bool {
        let Some(policy) = self.claim else {
            return false;
        };
        let mut last = self.last_claim.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) if at.elapsed() < policy.interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Move abandoned entries of other consumers to this one and queue them for delivery.
    async fn claim_abandoned(&self, policy: ClaimPolicy) -> AppResult<usize> {
        let min_idle_ms = policy.min_idle.as_millis() as usize;
        let mut conn = self.writer.clone();
        let mut start = "-".to_string();
        let mut total = 0;

        loop {
            let page: StreamPendingCountReply = conn
                .xpending_count(&self.stream, &self.group, &start, "+", CLAIM_PAGE_SIZE)
                .await?;
            let Some(last) = page.ids.last() else {
                break;
            };
            start = format!("({}", last.id);
            let full_page = page.ids.len() == CLAIM_PAGE_SIZE;

            let abandoned: Vec<String> = page
                .ids
                .into_iter()
                .filter(|p| p.consumer != self.consumer && p.last_delivered_ms >= min_idle_ms)
                .map(|p| p.id)
                .collect();

            if !abandoned.is_empty() {
                // XCLAIM re-checks idleness, so only one of several racing claimers wins
                let reply: StreamClaimReply = conn
                    .xclaim(&self.stream, &self.group, &self.consumer, min_idle_ms, abandoned.as_slice())
                    .await?;
                total += reply.ids.len();
                let mut queue = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
                queue.extend(reply.ids.into_iter().map(to_bus_message));
            }

            if !full_page {
                break;
            }
        }

        Ok(total)
    }

    fn next_claimed(&self) -> Option<BusMessage> {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Next entry of our pending list after the cursor, if any.
    async fn fetch_pending(&self) -> AppResult<Option<BusMessage>> {
        let cursor = self
            .pending_cursor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.stream.as_str()], &[cursor.as_str()], &opts)
            .await?;

        let next = reply.and_then(first_message);
        let mut cursor = self.pending_cursor.lock().unwrap_or_else(|e| e.into_inner());
        match &next {
            Some(msg) => *cursor = msg.id.clone(),
            None => {
                *cursor = PENDING_START.to_string();
                self.replaying.store(false, Ordering::Release);
            }
        }
        Ok(next)
    }

    async fn fetch_new(&self) -> AppResult<Option<BusMessage>> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(self.block_ms);
        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.stream.as_str()], &[">"], &opts)
            .await?;

        Ok(reply.and_then(first_message))
    }
}

#[async_trait]
impl MessageSource for RedisStreamConsumer {
    async fn fetch(&self) -> AppResult<Option<BusMessage>> {
        if let Some(policy) = self.claim {
            if self.claim_due() {
                let claimed = self.claim_abandoned(policy).await?;
                if claimed > 0 {
                    tracing::warn!(stream = %self.stream, consumer = %self.consumer, claimed, "Claimed abandoned messages");
                }
            }
        }
        if let Some(msg) = self.next_claimed() {
            return Ok(Some(msg));
        }

        self.start_replay_if_due();

        if self.replaying.load(Ordering::Acquire) {
            if let Some(msg) = self.fetch_pending().await? {
                tracing::debug!(stream = %self.stream, message_id = %msg.id, "Redelivering pending message");
                return Ok(Some(msg));
            }
        }

        self.fetch_new().await
    }

    async fn commit(&self, ids: &[MessageId]) -> AppResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.writer.clone();
        let _: i64 = conn.xack(&self.stream, &self.group, ids).await?;
        Ok(())
    }
}

/// Appends payloads to a Redis stream in pipelined chunks.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: ConnectionManager,
    stream: String,
    chunk_size: usize,
}

impl RedisStreamPublisher {
    pub fn new(conn: ConnectionManager, stream: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            conn,
            stream: stream.into(),
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl MessagePublisher for RedisStreamPublisher {
    async fn publish(&self, payloads: Vec<Vec<u8>>) -> AppResult<()> {
        let mut conn = self.conn.clone();

        for chunk in payloads.chunks(self.chunk_size) {
            let mut pipe = redis::pipe();
            for payload in chunk {
                pipe.cmd("XADD")
                    .arg(&self.stream)
                    .arg("*")
                    .arg(PAYLOAD_FIELD)
                    .arg(payload.as_slice())
                    .ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }

        Ok(())
    }
}

fn first_message(reply: StreamReadReply) -> Option<BusMessage> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .next()
        .map(to_bus_message)
}

/// Entries trimmed from the stream come back without fields and yield an empty payload.
fn to_bus_message(entry: StreamId) -> BusMessage {
    BusMessage {
        payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default(),
        id: entry.id,
    }
}
