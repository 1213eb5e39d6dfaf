use crate::traits::BroadcastClient;
use crate::types::{DispatchResult, Entry, PublishConfig, PublishOutcome, Result};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Destination album limit per send call.
const MAX_MEDIA_PER_CALL: usize = 10;

/// Single shared minimum-interval gate. The broadcast destination enforces
/// one platform-wide rate, so the gate is global across all feed workers.
pub struct RateGate {
    last_send: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_send: Mutex::new(None),
            min_interval,
        }
    }

    /// Waits until a send slot is available. Holding the lock across the
    /// sleep serializes concurrent senders in arrival order.
    pub async fn acquire(&self) {
        let mut last = self.last_send.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!("Rate gate: waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Sends approved entries to the broadcast destination with bounded retry.
pub struct Dispatcher {
    client: std::sync::Arc<dyn BroadcastClient>,
    gate: RateGate,
    config: PublishConfig,
}

impl Dispatcher {
    pub fn new(client: std::sync::Arc<dyn BroadcastClient>, config: PublishConfig) -> Self {
        let gate = RateGate::new(config.min_send_interval);
        Self {
            client,
            gate,
            config,
        }
    }

    /// Drive one entry to a terminal outcome for this cycle. Deferred
    /// outcomes leave the entry unclaimed so the next cycle retries it.
    pub async fn dispatch(&self, entry: &Entry) -> Result<DispatchResult> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: self.config.initial_backoff,
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempts = 0u32;
        let mut rate_waits = 0u32;

        loop {
            self.gate.acquire().await;

            let outcome = match self.client.send(entry).await {
                Ok(outcome) => outcome,
                Err(e) => PublishOutcome::TransientFailure {
                    reason: e.to_string(),
                },
            };

            match outcome {
                PublishOutcome::Delivered => {
                    info!("Delivered entry '{}'", entry.identifier);
                    return Ok(DispatchResult::Delivered);
                }
                PublishOutcome::RateLimited { retry_after } => {
                    rate_waits += 1;
                    if rate_waits > self.config.max_rate_limit_waits {
                        warn!(
                            "Entry '{}' still rate limited after {} waits, deferring",
                            entry.identifier, self.config.max_rate_limit_waits
                        );
                        return Ok(DispatchResult::RateLimitExhausted);
                    }
                    warn!(
                        "Rate limited on '{}', waiting {:?} ({}/{})",
                        entry.identifier, retry_after, rate_waits, self.config.max_rate_limit_waits
                    );
                    tokio::time::sleep(retry_after).await;
                }
                PublishOutcome::Rejected { reason } => {
                    error!("Entry '{}' rejected: {}", entry.identifier, reason);
                    return Ok(DispatchResult::Rejected { reason });
                }
                PublishOutcome::TransientFailure { reason } => {
                    attempts += 1;
                    if attempts >= self.config.max_attempts {
                        return Ok(DispatchResult::RetriesExhausted { reason });
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            warn!(
                                "Attempt {} failed for '{}' ({}), retrying in {:?}",
                                attempts, entry.identifier, reason, delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Ok(DispatchResult::RetriesExhausted { reason }),
                    }
                }
            }
        }
    }
}

/// Broadcast adapter posting entry media and caption metadata to the
/// destination endpoint.
pub struct HttpBroadcaster {
    client: Client,
    endpoint: String,
    default_cooldown: Duration,
}

impl HttpBroadcaster {
    pub fn new(endpoint: String, timeout_seconds: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            endpoint,
            default_cooldown: Duration::from_secs(30),
        }
    }

    async fn send_chunk(
        &self,
        entry: &Entry,
        chunk: &[crate::types::MediaItem],
        caption: Option<&str>,
    ) -> PublishOutcome {
        let payload = serde_json::json!({
            "caption": caption,
            "media": chunk.iter().map(|m| m.url.as_str()).collect::<Vec<_>>(),
            "published_at": entry.published_at.to_rfc3339(),
        });

        let response = match self.client.post(&self.endpoint).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                return PublishOutcome::TransientFailure {
                    reason: e.to_string(),
                }
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(self.default_cooldown);
            return PublishOutcome::RateLimited { retry_after };
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return PublishOutcome::Rejected {
                reason: format!("HTTP {}: {}", status, body),
            };
        }
        if !status.is_success() {
            return PublishOutcome::TransientFailure {
                reason: format!("HTTP {}", status),
            };
        }
        PublishOutcome::Delivered
    }
}

#[async_trait]
impl BroadcastClient for HttpBroadcaster {
    async fn send(&self, entry: &Entry) -> Result<PublishOutcome> {
        let caption = compose_caption(entry);

        for (i, chunk) in entry.media.chunks(MAX_MEDIA_PER_CALL).enumerate() {
            let chunk_caption = if i == 0 { Some(caption.as_str()) } else { None };
            match self.send_chunk(entry, chunk, chunk_caption).await {
                PublishOutcome::Delivered => {}
                other => return Ok(other),
            }
        }
        Ok(PublishOutcome::Delivered)
    }
}

/// Caption shown with the album: creator hashtag plus the source link.
fn compose_caption(entry: &Entry) -> String {
    match &entry.author {
        Some(author) => format!("#{}\n{}", author.replace(' ', "_"), entry.link),
        None => entry.link.clone(),
    }
}
