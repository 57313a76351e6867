use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::ClaimPolicy;

/// Global application configuration loaded from environment variables.
///
/// Every service reads the same struct and uses the slice it needs.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// `production` selects the Twilio gateway and callback signature checks
    pub app_env: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string (message bus)
    pub redis_url: String,

    /// Deadline for a single store call, distinct from the outer loop (default: 2000)
    pub context_timeout_ms: u64,

    /// Delivery attempts before a notification is marked failed (default: 5)
    pub max_attempts: i32,

    /// Base unit of the exponential retry backoff (default: 1000)
    pub backoff_base_ms: u64,

    /// Buffered notifications that force an ingestion flush (default: 200000)
    pub ingest_batch_size: usize,

    /// Ingestion flush timer (default: 5000)
    pub ingest_flush_interval_ms: u64,

    /// Delivery tasks written per bus pipeline (default: 10000)
    pub task_publish_batch_size: usize,

    /// Rows claimed per rebalancer tick (default: 10000)
    pub rebalancer_batch_size: i64,

    /// Rebalancer tick interval (default: 60000)
    pub rebalancer_interval_ms: u64,

    /// Lease duration after which an in-flight row is reclaimed (default: 300)
    pub stale_window_secs: u64,

    /// Stream carrying inbound notification requests
    pub requests_stream: String,

    /// Stream carrying delivery tasks
    pub tasks_stream: String,

    /// Consumer name inside the stream consumer group
    pub consumer_name: String,

    /// How long a bus fetch blocks before returning empty (default: 1000)
    pub bus_block_ms: u64,

    /// How often the sender re-reads its unacknowledged tasks (default: 30000)
    pub task_redelivery_interval_ms: u64,

    /// Idle time after which another consumer's unacknowledged message is taken over (default: 300000)
    pub claim_idle_ms: u64,

    /// How often each consumer looks for abandoned messages (default: 60000)
    pub claim_interval_ms: u64,

    /// Callback API listen port (default: 8081)
    pub api_port: u16,

    /// Public origin the provider uses to reach the callback API
    pub public_base_url: String,

    /// Full status callback URL handed to the provider
    pub status_callback_url: String,

    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,

    /// Directory the development gateway writes messages to
    pub dev_sms_dir: String,

    /// Chance (0.0-1.0) that the development gateway fails a send
    pub dev_sms_fail_rate: f64,

    /// Chance (0.0-1.0) that the development gateway reports a failed delivery
    pub dev_sms_callback_fail_rate: f64,

    /// Delay before the development gateway fires its status callback
    pub dev_sms_callback_delay_ms: u64,
}

/// Stream consumer group of the ingestion batcher.
pub const REQUESTS_CONSUMER_GROUP: &str = "notification-requests-group";

/// Stream consumer group of the delivery worker.
pub const TASKS_CONSUMER_GROUP: &str = "notification-tasks-group";

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let public_base_url = env_or("PUBLIC_BASE_URL", "http://localhost:8081");
        let status_callback_url = std::env::var("STATUS_CALLBACK_URL")
            .unwrap_or_else(|_| format!("{}/callback", public_base_url.trim_end_matches('/')));

        Ok(Self {
            app_env: env_or("APP_ENV", "development"),
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            context_timeout_ms: parse_env("CONTEXT_TIMEOUT_MS", "2000")?,
            max_attempts: parse_env("MAX_NOTIFICATION_ATTEMPTS", "5")?,
            backoff_base_ms: parse_env("BACKOFF_BASE_MS", "1000")?,
            ingest_batch_size: parse_env("INGEST_BATCH_SIZE", "200000")?,
            ingest_flush_interval_ms: parse_env("INGEST_FLUSH_INTERVAL_MS", "5000")?,
            task_publish_batch_size: parse_env("TASK_PUBLISH_BATCH_SIZE", "10000")?,
            rebalancer_batch_size: parse_env("REBALANCER_BATCH_SIZE", "10000")?,
            rebalancer_interval_ms: parse_env("REBALANCER_INTERVAL_MS", "60000")?,
            stale_window_secs: parse_env("STALE_WINDOW_SECS", "300")?,
            requests_stream: env_or("STREAM_NOTIFICATION_REQUESTS", "notification.requests"),
            tasks_stream: env_or("STREAM_NOTIFICATION_TASKS", "notification.tasks"),
            consumer_name: std::env::var("CONSUMER_NAME").unwrap_or_else(|_| default_consumer_name()),
            bus_block_ms: parse_env("BUS_BLOCK_MS", "1000")?,
            task_redelivery_interval_ms: parse_env("TASK_REDELIVERY_INTERVAL_MS", "30000")?,
            claim_idle_ms: parse_env("CLAIM_IDLE_MS", "300000")?,
            claim_interval_ms: parse_env("CLAIM_INTERVAL_MS", "60000")?,
            api_port: parse_env("API_PORT", "8081")?,
            public_base_url,
            status_callback_url,
            twilio_account_sid: std::env::var("TWILIO_ACCOUNT_SID").ok(),
            twilio_auth_token: std::env::var("TWILIO_AUTH_TOKEN").ok(),
            twilio_from_number: std::env::var("TWILIO_FROM_NUMBER").ok(),
            dev_sms_dir: env_or("DEV_SMS_DIR", "/tmp/sms-dev"),
            dev_sms_fail_rate: parse_env("DEV_SMS_FAIL_RATE", "0.05")?,
            dev_sms_callback_fail_rate: parse_env("DEV_SMS_CALLBACK_FAIL_RATE", "0.2")?,
            dev_sms_callback_delay_ms: parse_env("DEV_SMS_CALLBACK_DELAY_MS", "3000")?,
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn ingest_flush_interval(&self) -> Duration {
        Duration::from_millis(self.ingest_flush_interval_ms)
    }

    pub fn rebalancer_interval(&self) -> Duration {
        Duration::from_millis(self.rebalancer_interval_ms)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }

    pub fn task_redelivery_interval(&self) -> Duration {
        Duration::from_millis(self.task_redelivery_interval_ms)
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            min_idle: Duration::from_millis(self.claim_idle_ms),
            interval: Duration::from_millis(self.claim_interval_ms),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl AppConfig {
    /// Defaults with no external endpoints and short timers.
    pub fn for_tests() -> Self {
        Self {
            app_env: "test".to_string(),
            database_url: String::new(),
            db_max_connections: 1,
            redis_url: String::new(),
            context_timeout_ms: 1000,
            max_attempts: 5,
            backoff_base_ms: 1000,
            ingest_batch_size: 5,
            ingest_flush_interval_ms: 500,
            task_publish_batch_size: 100,
            rebalancer_batch_size: 100,
            rebalancer_interval_ms: 20,
            stale_window_secs: 300,
            requests_stream: "notification.requests".to_string(),
            tasks_stream: "notification.tasks".to_string(),
            consumer_name: "herald-test".to_string(),
            bus_block_ms: 10,
            task_redelivery_interval_ms: 1000,
            claim_idle_ms: 60_000,
            claim_interval_ms: 10_000,
            api_port: 0,
            public_base_url: "http://localhost:8081".to_string(),
            status_callback_url: "http://localhost:8081/callback".to_string(),
            twilio_account_sid: None,
            twilio_auth_token: None,
            twilio_from_number: None,
            dev_sms_dir: std::env::temp_dir().join("herald-sms-test").display().to_string(),
            dev_sms_fail_rate: 0.0,
            dev_sms_callback_fail_rate: 0.0,
            dev_sms_callback_delay_ms: 0,
        }
    }
}

/// Unique per process; pending messages left under an old name are recovered by claiming.
fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("herald-{}-{}", host, std::process::id())
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    let raw = env_or(key, default);
    raw.parse()
        .map_err(|_| anyhow::anyhow!("{} must be a valid {}", key, std::any::type_name::<T>()))
}
