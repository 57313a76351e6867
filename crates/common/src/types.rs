use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a notification. `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    InFlight,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::InFlight => "in_flight",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "in_flight" => Ok(NotificationStatus::InFlight),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// One SMS to one recipient. The only persistent entity.
///
/// Payload fields never change after ingestion; only `status`, `attempts`,
/// `next_run_at` and `updated_at` move. While `in_flight`, `updated_at` is the lease timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: i64,
    pub text: String,
    pub recipient_phone: String,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Fresh notification as the batcher hands it to `create_many`: new id, first attempt in flight.
    pub fn new(user_id: i64, text: impl Into<String>, recipient_phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            text: text.into(),
            recipient_phone: recipient_phone.into(),
            status: NotificationStatus::InFlight,
            attempts: 1,
            next_run_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A recipient as carried on the inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub name: String,
    pub phone: String,
}

/// Inbound request on the `notification.requests` stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub template: String,
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

impl NotificationRequest {
    /// Reject content the store cannot hold. Postgres `TEXT` has no room for NUL bytes.
    pub fn validate(&self) -> Result<(), String> {
        if self.template.contains('\0') {
            return Err("template contains a NUL byte".to_string());
        }
        if let Some(i) = self.contacts.iter().position(|c| c.phone.contains('\0')) {
            return Err(format!("phone of contact {} contains a NUL byte", i));
        }
        Ok(())
    }
}

/// Delivery task on the `notification.tasks` stream. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendNotificationTask {
    pub id: Uuid,
    pub text: String,
    #[serde(rename = "recipientPhone")]
    pub recipient_phone: String,
    pub attempts: i32,
}

impl From<&Notification> for SendNotificationTask {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            text: n.text.clone(),
            recipient_phone: n.recipient_phone.clone(),
            attempts: n.attempts,
        }
    }
}
