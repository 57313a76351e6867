//! Development gateway: writes each SMS to a file and fakes the provider callback.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use herald_common::config::AppConfig;

use crate::gateway::{SendError, SmsGateway, callback_url_for};

pub struct DevGateway {
    dir: PathBuf,
    status_callback_url: String,
    /// Chance (0.0-1.0) of a simulated send failure
    fail_rate: f64,
    /// Chance (0.0-1.0) that the fake callback reports `failed`
    callback_fail_rate: f64,
    callback_delay: Duration,
    client: reqwest::Client,
}

impl DevGateway {
    pub fn new(
        dir: impl Into<PathBuf>,
        status_callback_url: String,
        fail_rate: f64,
        callback_fail_rate: f64,
        callback_delay: Duration,
    ) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            status_callback_url,
            fail_rate,
            callback_fail_rate,
            callback_delay,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()?,
        })
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.dev_sms_dir,
            config.status_callback_url.clone(),
            config.dev_sms_fail_rate,
            config.dev_sms_callback_fail_rate,
            Duration::from_millis(config.dev_sms_callback_delay_ms),
        )
    }

    fn spawn_callback(&self, notification_id: Uuid, message_sid: String, to: String, status: &'static str) {
        let url = match callback_url_for(&self.status_callback_url, notification_id) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid status callback url, skipping dev callback");
                return;
            }
        };
        let client = self.client.clone();
        let delay = self.callback_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let form = [
                ("MessageSid", message_sid.as_str()),
                ("MessageStatus", status),
                ("To", to.as_str()),
                ("From", "DEV-SENDER"),
            ];
            if let Err(e) = client.post(url).form(&form).send().await {
                tracing::warn!(notification_id = %notification_id, error = %e, "Dev status callback failed");
            }
        });
    }
}

#[async_trait]
impl SmsGateway for DevGateway {
    async fn send_sms(&self, to: &str, body: &str, notification_id: Uuid) -> Result<(), SendError> {
        let (send_fails, delivery_fails) = {
            let mut rng = rand::thread_rng();
            (
                rng.r#gen::<f64>() < self.fail_rate,
                rng.r#gen::<f64>() < self.callback_fail_rate,
            )
        };

        if send_fails {
            return Err(SendError::retryable(None, "dev sender: simulated send failure"));
        }

        let stamp = chrono::Utc::now().format("%d.%m.%Y-%H:%M:%S").to_string();
        let file_name = format!("{}__{}__{}.txt", stamp, to, notification_id);

        // A failed delivery never reaches the handset, so nothing is written
        if !delivery_fails {
            let contents = format!("To: {}\n\n{}\n\n{}", to, body, stamp);
            tokio::fs::write(self.dir.join(&file_name), contents)
                .await
                .map_err(|e| SendError::permanent(None, format!("failed to write sms file: {}", e)))?;
        }

        let status = if delivery_fails { "failed" } else { "sent" };
        self.spawn_callback(notification_id, file_name, to.to_string(), status);
        Ok(())
    }
}
