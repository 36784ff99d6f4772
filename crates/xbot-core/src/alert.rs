//! Webhook alerting.
//!
//! Failures here are logged by callers and never abort the pipeline.

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::error::AlertError;
use crate::media::MediaEntry;

pub trait Alerter {
    /// Push a plain-text message.
    fn alert(&self, message: &str) -> Result<(), AlertError>;
}

/// Feishu/Lark custom bot webhook.
pub struct LarkAlerter {
    client: Client,
    url: String,
}

impl LarkAlerter {
    pub fn new(url: String, timeout: Duration) -> Result<Self, AlertError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

impl Alerter for LarkAlerter {
    fn alert(&self, message: &str) -> Result<(), AlertError> {
        let payload = json!({
            "msg_type": "text",
            "content": {"text": format!("🔔 X-Bot alert\n{}", message)},
        });
        let resp = self.client.post(&self.url).json(&payload).send()?;
        if !resp.status().is_success() {
            return Err(AlertError::Status(resp.status().as_u16()));
        }
        info!("webhook alert delivered");
        Ok(())
    }
}

/// Used when no webhook is configured: alerts only go to the log.
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, message: &str) -> Result<(), AlertError> {
        warn!(alert = %message, "alert (no webhook configured)");
        Ok(())
    }
}

/// Send an alert, logging instead of failing. Returns whether it went out.
pub fn send_alert(alerter: &dyn Alerter, message: &str) -> bool {
    match alerter.alert(message) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to deliver alert");
            false
        }
    }
}

/// Alert a terminal entry unless its alert already went out.
pub fn alert_terminal_once(alerter: &dyn Alerter, entry: &mut MediaEntry) {
    if entry.upload_info.notification_sent {
        return;
    }
    let Some(kind) = entry.terminal_error() else { return };
    let message = format!(
        "{}: {} (@{}, {})\n{}",
        kind.as_str(),
        entry.file_name,
        entry.user.screen_name,
        entry.media_type,
        entry.upload_info.message.as_deref().unwrap_or(&entry.url),
    );
    if send_alert(alerter, &message) {
        entry.upload_info.notification_sent = true;
    }
}
