//! In-process bus with the same delivery semantics as the Redis one.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BusMessage, MessageId, MessagePublisher, MessageSource};
use crate::error::{AppError, AppResult};

/// How long an empty fetch waits before reporting "nothing arrived".
const EMPTY_FETCH_WAIT: Duration = Duration::from_millis(20);

#[derive(Default)]
struct State {
    queue: VecDeque<BusMessage>,
    pending: BTreeMap<MessageId, BusMessage>,
    acked: Vec<MessageId>,
    published: Vec<Vec<u8>>,
    next_id: u64,
    fail_next_publishes: usize,
}

/// Stream stand-in: publish appends, fetch moves a message to pending, commit acks it.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<State>,
    arrived: Notify,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue one payload and return its id.
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> MessageId {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state.queue.push_back(BusMessage {
                id: id.clone(),
                payload: payload.into(),
            });
            id
        };
        self.arrived.notify_one();
        id
    }

    /// Every payload ever published, in order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<MessageId> {
        self.lock().acked.clone()
    }

    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.lock().pending.keys().cloned().collect()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Put every fetched-but-unacknowledged message back at the head of the queue.
    pub fn redeliver_pending(&self) {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        for (_, msg) in pending.into_iter().rev() {
            state.queue.push_front(msg);
        }
        drop(state);
        self.arrived.notify_one();
    }

    /// Make the next `n` publish calls fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().fail_next_publishes = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_next(&self) -> Option<BusMessage> {
        let mut state = self.lock();
        let msg = state.queue.pop_front()?;
        state.pending.insert(msg.id.clone(), msg.clone());
        Some(msg)
    }
}

#[async_trait]
impl MessageSource for MemoryBus {
    async fn fetch(&self) -> AppResult<Option<BusMessage>> {
        if let Some(msg) = self.take_next() {
            return Ok(Some(msg));
        }
        let _ = tokio::time::timeout(EMPTY_FETCH_WAIT, self.arrived.notified()).await;
        Ok(self.take_next())
    }

    async fn commit(&self, ids: &[MessageId]) -> AppResult<()> {
        let mut state = self.lock();
        for id in ids {
            if state.pending.remove(id).is_some() {
                state.acked.push(id.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePublisher for MemoryBus {
    async fn publish(&self, payloads: Vec<Vec<u8>>) -> AppResult<()> {
        {
            let mut state = self.lock();
            if state.fail_next_publishes > 0 {
                state.fail_next_publishes -= 1;
                return Err(AppError::Internal("injected publish failure".to_string()));
            }
            for payload in payloads {
                state.next_id += 1;
                let id = format!("{}-0", state.next_id);
                state.published.push(payload.clone());
                state.queue.push_back(BusMessage { id, payload });
            }
        }
        self.arrived.notify_one();
        Ok(())
    }
}
