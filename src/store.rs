use crate::traits::{DedupStore, FeedRegistry};
use crate::types::{ClaimOutcome, FeedSource, RelayError, Result, TrackedFeed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Connect to the store and bring the schema up to date.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPool::connect(database_url).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// Deterministic one-way hash of a raw entry identifier, used as the
/// unique dedup key.
pub fn hash_identifier(raw_identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_identifier.as_bytes());
    hex::encode(hasher.finalize())
}

/// Load the global publish cutoff, inserting the operator-supplied default
/// on first run. The value is immutable afterwards; entries timestamped
/// before it are never fetched or published.
pub async fn load_or_init_cutoff(pool: &PgPool, default: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let row = sqlx::query("SELECT post_date_cut_off FROM config LIMIT 1")
        .fetch_optional(pool)
        .await?;

    if let Some(row) = row {
        let cutoff: DateTime<Utc> = row.try_get("post_date_cut_off")?;
        debug!("Loaded post date cutoff: {}", cutoff);
        return Ok(cutoff);
    }

    sqlx::query("INSERT INTO config (post_date_cut_off) VALUES ($1)")
        .bind(default)
        .execute(pool)
        .await?;
    info!("Initialized post date cutoff to {}", default);
    Ok(default)
}

pub struct PgFeedRegistry {
    pool: PgPool,
}

impl PgFeedRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a new creator feed. Admin operation; the pipeline itself
    /// never creates or deletes feeds.
    pub async fn add_feed(&self, source: FeedSource, url: &str, username: &str) -> Result<Uuid> {
        let feed_id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO rss_feeds (id, source, url, username)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(feed_id)
        .bind(source.as_str())
        .bind(url)
        .bind(username)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            info!("Feed already registered: {}", url);
        } else {
            info!("Registered feed {} for {} ({})", url, username, source.as_str());
        }
        Ok(feed_id)
    }

    pub async fn remove_feed(&self, url: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM rss_feeds WHERE url = $1")
            .bind(url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::FeedNotFound(url.to_string()));
        }
        info!("Removed feed: {}", url);
        Ok(())
    }
}

#[async_trait]
impl FeedRegistry for PgFeedRegistry {
    async fn list(&self) -> Result<Vec<TrackedFeed>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, url, username, last_published_entry_cursor
            FROM rss_feeds
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut feeds = Vec::with_capacity(rows.len());
        for row in rows {
            let source: String = row.try_get("source")?;
            feeds.push(TrackedFeed {
                id: row.try_get("id")?,
                source: FeedSource::from_str(&source)?,
                url: row.try_get("url")?,
                username: row.try_get("username")?,
                cursor: row.try_get("last_published_entry_cursor")?,
            });
        }
        Ok(feeds)
    }

    async fn advance_cursor(&self, feed_id: Uuid, cursor: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE rss_feeds SET last_published_entry_cursor = $1 WHERE id = $2",
        )
        .bind(cursor)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayError::FeedNotFound(feed_id.to_string()));
        }
        debug!("Advanced cursor for feed {} to '{}'", feed_id, cursor);
        Ok(())
    }
}

pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn try_claim(&self, raw_identifier: &str) -> Result<ClaimOutcome> {
        let hashed = hash_identifier(raw_identifier);
        // The unique constraint on hashed_identifier makes the insert the
        // authoritative dedup decision under concurrent claims.
        let result = sqlx::query(
            r#"
            INSERT INTO published_identifiers (id, raw_identifier, hashed_identifier)
            VALUES ($1, $2, $3)
            ON CONFLICT (hashed_identifier) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(raw_identifier)
        .bind(&hashed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(ClaimOutcome::AlreadyClaimed)
        } else {
            debug!("Claimed identifier '{}'", raw_identifier);
            Ok(ClaimOutcome::Claimed)
        }
    }

    async fn is_claimed(&self, raw_identifier: &str) -> Result<bool> {
        let hashed = hash_identifier(raw_identifier);
        let row = sqlx::query(
            "SELECT 1 AS present FROM published_identifiers WHERE hashed_identifier = $1",
        )
        .bind(&hashed)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
