use std::time::Duration;

use herald_common::config::AppConfig;

/// Largest exponent applied to the backoff base.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// What to do with a notification after a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, due again after the delay
    Reschedule(Duration),
    /// Attempt budget spent
    Fail,
}

/// Attempt-bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub max_attempts: i32,
    pub backoff_base: Duration,
}

impl DeliveryPolicy {
    pub fn new(max_attempts: i32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base())
    }

    /// `base * 2^(attempts - 1)`, with `attempts` taken as at least 1.
    pub fn backoff_delay(&self, attempts: i32) -> Duration {
        let exponent = (attempts.max(1) - 1) as u32;
        let factor = 2u32.saturating_pow(exponent.min(MAX_BACKOFF_EXPONENT));
        self.backoff_base.saturating_mul(factor)
    }

    pub fn decide(&self, attempts: i32) -> RetryDecision {
        if attempts >= self.max_attempts {
            RetryDecision::Fail
        } else {
            RetryDecision::Reschedule(self.backoff_delay(attempts))
        }
    }
}
