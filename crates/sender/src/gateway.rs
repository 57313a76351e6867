use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Whether a failed send is worth retrying. Only affects logging; the attempt
/// budget decides what happens next either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    Retryable,
    Permanent,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SendError {
    pub kind: SendErrorKind,
    /// Provider error code, when the provider returned one
    pub code: Option<i64>,
    pub message: String,
}

impl SendError {
    pub fn retryable(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Retryable,
            code,
            message: message.into(),
        }
    }

    pub fn permanent(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            kind: SendErrorKind::Permanent,
            code,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == SendErrorKind::Retryable
    }
}

/// Outbound SMS provider.
///
/// A successful send only means the provider accepted the message; the final
/// outcome arrives later on the status callback tagged with `notification_id`.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str, notification_id: Uuid) -> Result<(), SendError>;
}

/// Status callback URL for one notification.
pub fn callback_url_for(base: &str, notification_id: Uuid) -> Result<url::Url, url::ParseError> {
    let mut url = url::Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("notification_id", &notification_id.to_string());
    Ok(url)
}
