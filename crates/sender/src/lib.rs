//! Delivery Worker: sends delivery tasks through an SMS gateway and applies the retry policy.

pub mod dev;
pub mod gateway;
pub mod policy;
pub mod twilio;
pub mod worker;

use std::sync::Arc;

use herald_common::config::AppConfig;

use crate::dev::DevGateway;
use crate::gateway::SmsGateway;
use crate::twilio::TwilioGateway;

/// Twilio in production, the file-writing development gateway everywhere else.
pub fn gateway_from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn SmsGateway>> {
    if config.is_production() {
        let gateway = TwilioGateway::from_config(config)?;
        tracing::info!("Using Twilio SMS gateway");
        return Ok(Arc::new(gateway));
    }

    let gateway = DevGateway::from_config(config)?;
    tracing::info!(dir = %config.dev_sms_dir, "Using development SMS gateway");
    Ok(Arc::new(gateway))
}
