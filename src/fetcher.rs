use crate::traits::EntrySource;
use crate::types::{Entry, FetchConfig, MediaItem, RelayError, Result, TrackedFeed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, warn};

/// Fetches a feed document from the aggregation proxy and turns it into
/// new entries since the feed's cursor, oldest-first.
pub struct FeedFetcher {
    client: Client,
    cutoff: DateTime<Utc>,
}

impl FeedFetcher {
    pub fn new(config: FetchConfig, cutoff: DateTime<Utc>) -> Self {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .expect("Failed to create HTTP client");

        Self { client, cutoff }
    }

    /// Parse a fetched feed document into pipeline entries: drop entries
    /// without identifier or timestamp, apply the cutoff (exactly-at is
    /// included), sort oldest-first, and keep only entries after the cursor.
    fn entries_from_document(&self, feed: &TrackedFeed, body: &str) -> Result<Vec<Entry>> {
        let parsed = parser::parse(body.as_bytes())
            .map_err(|e| RelayError::Parse(format!("{}: {}", feed.url, e)))?;

        let mut entries = Vec::new();
        for item in parsed.entries {
            let link = item.links.first().map(|l| l.href.clone());
            let identifier = if !item.id.is_empty() {
                item.id.clone()
            } else if let Some(ref link) = link {
                link.clone()
            } else {
                debug!("Skipping entry with no identifier in {}", feed.url);
                continue;
            };

            let published_at = match item.published.or(item.updated) {
                Some(ts) => ts.with_timezone(&Utc),
                None => {
                    warn!("Skipping entry without publication date: {}", identifier);
                    continue;
                }
            };
            if published_at < self.cutoff {
                debug!("Skipping entry before cutoff: {}", identifier);
                continue;
            }

            let html = item
                .content
                .as_ref()
                .and_then(|c| c.body.clone())
                .or_else(|| item.summary.as_ref().map(|s| s.content.clone()))
                .unwrap_or_default();

            entries.push(Entry {
                feed_id: feed.id,
                identifier: identifier.clone(),
                title: item
                    .title
                    .map(|t| t.content)
                    .unwrap_or_else(|| "Untitled".to_string()),
                author: item.authors.first().map(|a| a.name.clone()),
                link: link.unwrap_or(identifier),
                published_at,
                tags: item.categories.into_iter().map(|c| c.term).collect(),
                media: extract_img_links(&html),
            });
        }

        entries.sort_by(|a, b| a.published_at.cmp(&b.published_at));

        // Resume after the last fully processed entry. An unknown cursor
        // (rotated out of the feed window) falls back to the cutoff filter.
        if let Some(cursor) = &feed.cursor {
            if let Some(pos) = entries.iter().position(|e| &e.identifier == cursor) {
                entries.drain(..=pos);
            }
        }

        Ok(entries)
    }
}

#[async_trait]
impl EntrySource for FeedFetcher {
    async fn fetch_since(&self, feed: &TrackedFeed) -> Result<Vec<Entry>> {
        debug!("Fetching feed: {}", feed.url);

        let response = self
            .client
            .get(&feed.url)
            .send()
            .await
            .map_err(|e| RelayError::Fetch(format!("{}: {}", feed.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Fetch(format!("{}: HTTP {}", feed.url, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Fetch(format!("{}: {}", feed.url, e)))?;

        let entries = self.entries_from_document(feed, &body)?;
        debug!("Feed {} produced {} new entries", feed.url, entries.len());
        Ok(entries)
    }
}

/// Pull `<img src>` URLs out of an entry's description HTML.
fn extract_img_links(html: &str) -> Vec<MediaItem> {
    if html.is_empty() {
        return Vec::new();
    }
    let fragment = Html::parse_fragment(html);
    let selector = Selector::parse("img").expect("static selector");
    fragment
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(|src| MediaItem {
            url: src.to_string(),
        })
        .collect()
}
