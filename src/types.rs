use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Platform a tracked feed originates from. Each kind has its own
/// address scheme on the aggregation proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    Pixiv,
    Twitter,
}

impl FeedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSource::Pixiv => "pixiv",
            FeedSource::Twitter => "twitter",
        }
    }

    /// Build the per-creator feed address served by the aggregation proxy.
    pub fn feed_address(&self, proxy_base: &str, username: &str) -> String {
        let base = proxy_base.trim_end_matches('/');
        match self {
            FeedSource::Pixiv => format!("{}/pixiv/user/{}", base, username),
            FeedSource::Twitter => format!("{}/twitter/user/{}", base, username),
        }
    }
}

impl FromStr for FeedSource {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pixiv" => Ok(FeedSource::Pixiv),
            "twitter" => Ok(FeedSource::Twitter),
            other => Err(RelayError::UnknownSource(other.to_string())),
        }
    }
}

/// A creator feed under watch, with the identifier of the last entry that
/// was fully processed (or None before the first successful cycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedFeed {
    pub id: Uuid,
    pub source: FeedSource,
    pub url: String,
    pub username: String,
    pub cursor: Option<String>,
}

/// One image reference extracted from an entry body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub url: String,
}

/// A feed entry as produced by the fetcher. Transient: consumed within one
/// cycle, only its identifier's hash survives in the dedup store.
#[derive(Debug, Clone)]
pub struct Entry {
    pub feed_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub author: Option<String>,
    pub link: String,
    pub published_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub media: Vec<MediaItem>,
}

/// Result of an atomic claim attempt on the dedup store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

/// Verdict of the moderation gate for a whole entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationVerdict {
    Approved,
    Blocked { reason: String },
    ClassifierUnavailable { reason: String },
}

/// Typed response from one broadcast send attempt.
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    Delivered,
    RateLimited { retry_after: Duration },
    Rejected { reason: String },
    TransientFailure { reason: String },
}

/// Final outcome of dispatching one entry within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Delivered,
    /// Destination kept rate limiting past the bounded number of waits;
    /// the entry is deferred to the next cycle.
    RateLimitExhausted,
    /// Transient failures exhausted the retry budget; deferred to the
    /// next cycle and surfaced to the failure notifier.
    RetriesExhausted { reason: String },
    /// The destination rejected the content outright; the entry is dropped.
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_seconds: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "feed-relay/0.1".to_string(),
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// An entry is blocked when any item scores strictly above this.
    pub nsfw_threshold: f32,
    /// Tags that block an entry by policy before any classifier call.
    pub restricted_tags: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            nsfw_threshold: 0.7,
            restricted_tags: vec!["R-18".to_string(), "漫画".to_string(), "AI".to_string()],
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Attempts per entry per cycle for transient failures.
    pub max_attempts: u32,
    /// Destination-cooldown waits per entry per cycle before deferring.
    pub max_rate_limit_waits: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Global minimum interval between broadcast sends, across all feeds.
    pub min_send_interval: Duration,
    pub timeout_seconds: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_rate_limit_waits: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            min_send_interval: Duration::from_secs(1),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub max_concurrent_feeds: usize,
    /// Alert after this many consecutive failed cycles for one feed.
    pub feed_failure_alert_after: u32,
    /// Alert when no cycle has completed successfully for this long.
    pub stale_pipeline_alert_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(6 * 3600),
            max_concurrent_feeds: 4,
            feed_failure_alert_after: 3,
            stale_pipeline_alert_after: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed fetch failed: {0}")]
    Fetch(String),

    #[error("feed parse error: {0}")]
    Parse(String),

    #[error("classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("feed not found: {0}")]
    FeedNotFound(String),

    #[error("unknown feed source: {0}")]
    UnknownSource(String),

    #[error("general error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
