use crate::types::{ClaimOutcome, Entry, MediaItem, PublishOutcome, Result, TrackedFeed};
use async_trait::async_trait;
use uuid::Uuid;

/// View of the tracked feeds backed by the persistent store.
#[async_trait]
pub trait FeedRegistry: Send + Sync {
    /// All tracked feeds. Order is only used for fairness across cycles.
    async fn list(&self) -> Result<Vec<TrackedFeed>>;

    /// Persist the new cursor for a feed. Must be called only after the
    /// corresponding entry has been durably marked published.
    async fn advance_cursor(&self, feed_id: Uuid, cursor: &str) -> Result<()>;
}

/// Hash-indexed record of previously published identifiers.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically record an identifier as published. The insert conflict is
    /// the authoritative already-published signal; this is never a
    /// read-then-write.
    async fn try_claim(&self, raw_identifier: &str) -> Result<ClaimOutcome>;

    /// Fast pre-filter only; `try_claim` remains the final authority.
    async fn is_claimed(&self, raw_identifier: &str) -> Result<bool>;
}

/// Adapter over the external feed-aggregation capability.
#[async_trait]
pub trait EntrySource: Send + Sync {
    /// New entries for the feed since its cursor, oldest-first and finite.
    /// Entries older than the configured cutoff are never returned.
    async fn fetch_since(&self, feed: &TrackedFeed) -> Result<Vec<Entry>>;
}

/// Scoring oracle for NSFW screening of a single media item.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Score in [0, 1]; higher means more likely NSFW.
    async fn nsfw_score(&self, item: &MediaItem) -> Result<f32>;
}

/// Publish capability for the single broadcast destination.
#[async_trait]
pub trait BroadcastClient: Send + Sync {
    /// One send attempt for one entry. Retry policy lives in the dispatcher.
    async fn send(&self, entry: &Entry) -> Result<PublishOutcome>;
}

/// Operational alert channel. Never used for content.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn alert(&self, message: &str) -> Result<()>;
}
