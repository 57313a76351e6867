//! In-memory Notification Store with the same transition rules as PostgreSQL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{Notification, NotificationStatus};

use crate::NotificationStore;

#[derive(Default)]
struct State {
    rows: HashMap<Uuid, Notification>,
    batches: Vec<usize>,
    fail_next: usize,
}

pub struct MemoryStore {
    state: Mutex<State>,
    stale_window: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryStore {
    pub fn new(stale_window: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            stale_window,
        }
    }

    /// Seed a row as-is.
    pub fn insert(&self, notification: Notification) {
        self.lock().rows.insert(notification.id, notification);
    }

    pub fn get(&self, id: Uuid) -> Option<Notification> {
        self.lock().rows.get(&id).cloned()
    }

    /// All rows ordered by creation then id.
    pub fn snapshot(&self) -> Vec<Notification> {
        let mut rows: Vec<Notification> = self.lock().rows.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }

    /// Sizes of every successful `create_many` call, in order.
    pub fn batches(&self) -> Vec<usize> {
        self.lock().batches.clone()
    }

    /// Make the next `n` store calls fail with an internal error.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Backdate a lease, as if the owning worker had gone quiet.
    pub fn set_updated_at(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(row) = self.lock().rows.get_mut(&id) {
            row.updated_at = updated_at;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn guard(state: &mut State) -> AppResult<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(AppError::Internal("injected store failure".to_string()));
        }
        Ok(())
    }

    /// Apply `update` to an open row, or explain why not.
    fn update_open(
        &self,
        id: Uuid,
        update: impl FnOnce(&mut Notification),
    ) -> AppResult<Notification> {
        let mut state = self.lock();
        Self::guard(&mut state)?;

        let row = state
            .rows
            .get_mut(&id)
            .ok_or_else(|| AppError::notification_not_found(id))?;
        if row.status.is_terminal() {
            return Err(AppError::TerminalStatus {
                id,
                status: row.status,
            });
        }

        update(row);
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create_many(&self, notifications: &[Notification]) -> AppResult<u64> {
        let mut state = self.lock();
        Self::guard(&mut state)?;

        if let Some(dup) = notifications.iter().find(|n| state.rows.contains_key(&n.id)) {
            return Err(AppError::Internal(format!(
                "duplicate notification id {}",
                dup.id
            )));
        }

        let now = Utc::now();
        for n in notifications {
            let mut row = n.clone();
            row.status = NotificationStatus::InFlight;
            row.attempts = 1;
            row.next_run_at = now;
            row.created_at = now;
            row.updated_at = now;
            state.rows.insert(row.id, row);
        }
        if !notifications.is_empty() {
            state.batches.push(notifications.len());
        }

        Ok(notifications.len() as u64)
    }

    async fn get_by_id(&self, id: Uuid) -> AppResult<Notification> {
        let mut state = self.lock();
        Self::guard(&mut state)?;

        state
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::notification_not_found(id))
    }

    async fn change_status(&self, id: Uuid, status: NotificationStatus) -> AppResult<()> {
        self.update_open(id, |row| row.status = status).map(|_| ())
    }

    async fn lease_due_and_stale(&self, limit: i64) -> AppResult<Vec<Notification>> {
        let mut state = self.lock();
        Self::guard(&mut state)?;

        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(self.stale_window)
                .map_err(|e| AppError::Internal(e.to_string()))?;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .rows
            .values()
            .filter(|n| match n.status {
                NotificationStatus::Pending => n.next_run_at <= now,
                NotificationStatus::InFlight => n.updated_at <= stale_before,
                _ => false,
            })
            .map(|n| (n.next_run_at, n.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(row) = state.rows.get_mut(&id) {
                row.status = NotificationStatus::InFlight;
                row.attempts += 1;
                row.updated_at = now;
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn reschedule(&self, id: Uuid, next_run_at: DateTime<Utc>) -> AppResult<Notification> {
        self.update_open(id, |row| {
            row.status = NotificationStatus::Pending;
            row.next_run_at = next_run_at;
        })
    }

    async fn mark_failed(&self, id: Uuid) -> AppResult<Notification> {
        self.update_open(id, |row| row.status = NotificationStatus::Failed)
    }
}
