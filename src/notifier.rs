use crate::traits::Notifier;
use crate::types::{RelayError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Posts operational alerts to the admin webhook. Content never goes
/// through this channel.
pub struct OpsNotifier {
    client: Client,
    webhook_url: String,
}

impl OpsNotifier {
    pub fn new(webhook_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            webhook_url,
        }
    }
}

#[async_trait]
impl Notifier for OpsNotifier {
    async fn alert(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::General(format!(
                "alert delivery failed: HTTP {}",
                status
            )));
        }
        debug!("Alert delivered: {}", message);
        Ok(())
    }
}
