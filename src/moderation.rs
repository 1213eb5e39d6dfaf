use crate::traits::Classifier;
use crate::types::{Entry, MediaItem, ModerationConfig, ModerationVerdict, RelayError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Decides whether an entry's media passes NSFW screening. The whole entry
/// is suppressed when any single item fails; items are never dropped
/// individually.
pub struct ModerationGate {
    classifier: Arc<dyn Classifier>,
    config: ModerationConfig,
}

impl ModerationGate {
    pub fn new(classifier: Arc<dyn Classifier>, config: ModerationConfig) -> Self {
        Self { classifier, config }
    }

    pub async fn classify(&self, entry: &Entry) -> ModerationVerdict {
        // Policy tags block without spending classifier calls.
        for tag in &entry.tags {
            if self
                .config
                .restricted_tags
                .iter()
                .any(|restricted| tag.contains(restricted.as_str()))
            {
                info!("Entry '{}' blocked by restricted tag '{}'", entry.identifier, tag);
                return ModerationVerdict::Blocked {
                    reason: format!("restricted tag '{}'", tag),
                };
            }
        }

        for item in &entry.media {
            match self.classifier.nsfw_score(item).await {
                Ok(score) if score > self.config.nsfw_threshold => {
                    info!(
                        "Entry '{}' blocked: {} scored {:.2} (threshold {:.2})",
                        entry.identifier, item.url, score, self.config.nsfw_threshold
                    );
                    return ModerationVerdict::Blocked {
                        reason: format!("{} scored {:.2}", item.url, score),
                    };
                }
                Ok(score) => {
                    debug!("{} scored {:.2}", item.url, score);
                }
                // Fail closed: an unreachable classifier approves nothing.
                Err(e) => {
                    return ModerationVerdict::ClassifierUnavailable {
                        reason: e.to_string(),
                    };
                }
            }
        }

        ModerationVerdict::Approved
    }
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f32,
}

/// Classifier adapter over the external scoring service.
pub struct HttpClassifier {
    client: Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: String, timeout_seconds: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");
        Self { client, endpoint }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn nsfw_score(&self, item: &MediaItem) -> Result<f32> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "url": item.url }))
            .send()
            .await
            .map_err(|e| RelayError::ClassifierUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::ClassifierUnavailable(format!("HTTP {}", status)));
        }

        let body: ScoreResponse = response
            .json()
            .await
            .map_err(|e| RelayError::ClassifierUnavailable(e.to_string()))?;
        Ok(body.score)
    }
}
