//! Webhook client (reqwest).
//!
//! Payloads carry context, never row data.

use crate::{NotifyError, Result};
use std::time::Duration;
use tracing::info;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts internal-error events to the configured webhook URL.
pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Webhook(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn post(&self, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError::Webhook(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Webhook(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        info!(url = %self.url, "posted webhook event");
        Ok(())
    }
}
