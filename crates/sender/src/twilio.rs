//! Twilio Messages API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use herald_common::config::AppConfig;

use crate::gateway::{SendError, SmsGateway, callback_url_for};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Provider codes worth another attempt.
const RETRYABLE_CODES: &[i64] = &[
    20429, // too many requests
    30001, // queue overflow
    30002, // account suspended
    30006, // landline or unreachable carrier
    30008, // unknown error
];

pub fn is_retryable_code(code: i64) -> bool {
    RETRYABLE_CODES.contains(&code)
}

/// Fields shared by Twilio error bodies and message resources.
#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    code: Option<i64>,
    message: Option<String>,
    error_code: Option<i64>,
    error_message: Option<String>,
}

pub struct TwilioGateway {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    status_callback_url: String,
}

impl TwilioGateway {
    pub fn new(
        account_sid: String,
        auth_token: String,
        from_number: String,
        status_callback_url: String,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            account_sid,
            auth_token,
            from_number,
            status_callback_url,
        })
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow::anyhow!("{} is required in production", name))
        };

        Self::new(
            required(&config.twilio_account_sid, "TWILIO_ACCOUNT_SID")?,
            required(&config.twilio_auth_token, "TWILIO_AUTH_TOKEN")?,
            required(&config.twilio_from_number, "TWILIO_FROM_NUMBER")?,
            config.status_callback_url.clone(),
        )
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", API_BASE, self.account_sid)
    }
}

#[async_trait]
impl SmsGateway for TwilioGateway {
    async fn send_sms(&self, to: &str, body: &str, notification_id: Uuid) -> Result<(), SendError> {
        let callback = callback_url_for(&self.status_callback_url, notification_id)
            .map_err(|e| SendError::permanent(None, format!("invalid status callback url: {}", e)))?;

        let form = [
            ("From", self.from_number.as_str()),
            ("To", to),
            ("Body", body),
            ("StatusCallback", callback.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| SendError::retryable(None, format!("twilio request failed: {}", e)))?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        classify_response(status, &raw)
    }
}

/// Turn a Messages API response into the send outcome.
fn classify_response(status: StatusCode, raw: &str) -> Result<(), SendError> {
    let parsed: ApiResponse = serde_json::from_str(raw).unwrap_or_default();

    if status.is_success() {
        return match parsed.error_code {
            Some(code) => Err(api_error(
                code,
                parsed.error_message.unwrap_or_else(|| "message rejected".to_string()),
            )),
            None => Ok(()),
        };
    }

    match parsed.code {
        Some(code) => Err(api_error(
            code,
            parsed.message.unwrap_or_else(|| status.to_string()),
        )),
        None if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => Err(
            SendError::retryable(Some(status.as_u16() as i64), format!("twilio returned {}", status)),
        ),
        None => Err(SendError::permanent(
            Some(status.as_u16() as i64),
            format!("twilio returned {}", status),
        )),
    }
}

fn api_error(code: i64, message: String) -> SendError {
    if is_retryable_code(code) {
        SendError::retryable(Some(code), message)
    } else {
        SendError::permanent(Some(code), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SendErrorKind;

    #[test]
    fn test_retryable_codes() {
        for code in [20429, 30001, 30002, 30006, 30008] {
            assert!(is_retryable_code(code), "{} should be retryable", code);
        }
        assert!(!is_retryable_code(21211));
        assert!(!is_retryable_code(21614));
    }

    #[test]
    fn test_created_message_is_success() {
        let body = r#"{"sid": "SM123", "status": "queued", "error_code": null, "error_message": null}"#;
        assert!(classify_response(StatusCode::CREATED, body).is_ok());
    }

    #[test]
    fn test_invalid_recipient_is_permanent() {
        let body = r#"{"code": 21211, "message": "The 'To' number is not valid.", "status": 400}"#;
        let err = classify_response(StatusCode::BAD_REQUEST, body).unwrap_err();
        assert_eq!(err.kind, SendErrorKind::Permanent);
        assert_eq!(err.code, Some(21211));
        assert!(err.message.contains("not valid"));
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let body = r#"{"code": 20429, "message": "Too Many Requests", "status": 429}"#;
        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, body).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code, Some(20429));
    }

    #[test]
    fn test_unparseable_server_error_is_retryable() {
        let err = classify_response(StatusCode::BAD_GATEWAY, "<html>").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code, Some(502));
    }

    #[test]
    fn test_error_code_on_accepted_message() {
        let body = r#"{"sid": "SM123", "error_code": 30001, "error_message": "Queue overflow"}"#;
        let err = classify_response(StatusCode::CREATED, body).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = AppConfig::for_tests();
        assert!(TwilioGateway::from_config(&config).is_err());
    }
}
