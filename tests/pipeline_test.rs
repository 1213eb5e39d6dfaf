use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use feed_relay::{
    BroadcastClient, Classifier, ClaimOutcome, DedupStore, Dispatcher, Entry, EntrySource,
    FeedRegistry, FeedSource, MediaItem, ModerationConfig, ModerationGate, Notifier,
    PublishConfig, PublishOutcome, RelayError, Result, Scheduler, SchedulerConfig, TrackedFeed,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

struct MemRegistry {
    feeds: Mutex<Vec<TrackedFeed>>,
}

impl MemRegistry {
    fn new(feeds: Vec<TrackedFeed>) -> Self {
        Self {
            feeds: Mutex::new(feeds),
        }
    }

    async fn cursor_of(&self, feed_id: Uuid) -> Option<String> {
        self.feeds
            .lock()
            .await
            .iter()
            .find(|f| f.id == feed_id)
            .and_then(|f| f.cursor.clone())
    }
}

#[async_trait]
impl FeedRegistry for MemRegistry {
    async fn list(&self) -> Result<Vec<TrackedFeed>> {
        Ok(self.feeds.lock().await.clone())
    }

    async fn advance_cursor(&self, feed_id: Uuid, cursor: &str) -> Result<()> {
        let mut feeds = self.feeds.lock().await;
        let feed = feeds
            .iter_mut()
            .find(|f| f.id == feed_id)
            .ok_or_else(|| RelayError::FeedNotFound(feed_id.to_string()))?;
        feed.cursor = Some(cursor.to_string());
        Ok(())
    }
}

struct MemDedup {
    claimed: Mutex<HashSet<String>>,
}

impl MemDedup {
    fn new() -> Self {
        Self {
            claimed: Mutex::new(HashSet::new()),
        }
    }

    async fn count(&self) -> usize {
        self.claimed.lock().await.len()
    }
}

#[async_trait]
impl DedupStore for MemDedup {
    async fn try_claim(&self, raw_identifier: &str) -> Result<ClaimOutcome> {
        if self.claimed.lock().await.insert(raw_identifier.to_string()) {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    async fn is_claimed(&self, raw_identifier: &str) -> Result<bool> {
        Ok(self.claimed.lock().await.contains(raw_identifier))
    }
}

/// Serves scripted entries, honoring the feed cursor the way the real
/// fetcher does (entries after the cursor's position, oldest-first).
struct ScriptedSource {
    entries: Mutex<HashMap<Uuid, Vec<Entry>>>,
    failing: Mutex<HashSet<Uuid>>,
}

impl ScriptedSource {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    async fn set_entries(&self, feed_id: Uuid, entries: Vec<Entry>) {
        self.entries.lock().await.insert(feed_id, entries);
    }

    async fn fail_feed(&self, feed_id: Uuid) {
        self.failing.lock().await.insert(feed_id);
    }
}

#[async_trait]
impl EntrySource for ScriptedSource {
    async fn fetch_since(&self, feed: &TrackedFeed) -> Result<Vec<Entry>> {
        if self.failing.lock().await.contains(&feed.id) {
            return Err(RelayError::Fetch("connection reset".to_string()));
        }
        let all = self
            .entries
            .lock()
            .await
            .get(&feed.id)
            .cloned()
            .unwrap_or_default();
        let entries = match &feed.cursor {
            Some(cursor) => match all.iter().position(|e| &e.identifier == cursor) {
                Some(pos) => all[pos + 1..].to_vec(),
                None => all,
            },
            None => all,
        };
        Ok(entries)
    }
}

struct StubClassifier {
    flagged: HashSet<String>,
    available: Arc<AtomicBool>,
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn nsfw_score(&self, item: &MediaItem) -> Result<f32> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RelayError::ClassifierUnavailable(
                "scoring service down".to_string(),
            ));
        }
        if self.flagged.contains(&item.url) {
            Ok(0.99)
        } else {
            Ok(0.05)
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum BroadcastMode {
    Deliver,
    RateLimit,
    Reject,
}

struct RecordingBroadcaster {
    delivered: Mutex<Vec<String>>,
    mode: Mutex<BroadcastMode>,
}

impl RecordingBroadcaster {
    fn new() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            mode: Mutex::new(BroadcastMode::Deliver),
        }
    }

    async fn set_mode(&self, mode: BroadcastMode) {
        *self.mode.lock().await = mode;
    }

    async fn delivered(&self) -> Vec<String> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl BroadcastClient for RecordingBroadcaster {
    async fn send(&self, entry: &Entry) -> Result<PublishOutcome> {
        match *self.mode.lock().await {
            BroadcastMode::Deliver => {
                self.delivered.lock().await.push(entry.identifier.clone());
                Ok(PublishOutcome::Delivered)
            }
            BroadcastMode::RateLimit => Ok(PublishOutcome::RateLimited {
                retry_after: Duration::from_millis(1),
            }),
            BroadcastMode::Reject => Ok(PublishOutcome::Rejected {
                reason: "unsendable content".to_string(),
            }),
        }
    }
}

struct RecordingNotifier {
    alerts: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
        }
    }

    async fn alerts(&self) -> Vec<String> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn alert(&self, message: &str) -> Result<()> {
        self.alerts.lock().await.push(message.to_string());
        Ok(())
    }
}

fn tracked_feed(cursor: Option<&str>) -> TrackedFeed {
    TrackedFeed {
        id: Uuid::new_v4(),
        source: FeedSource::Pixiv,
        url: "http://localhost:1200/pixiv/user/4729811".to_string(),
        username: "4729811".to_string(),
        cursor: cursor.map(|c| c.to_string()),
    }
}

fn entry(feed_id: Uuid, identifier: &str, day: u32, media: &[&str]) -> Entry {
    Entry {
        feed_id,
        identifier: identifier.to_string(),
        title: format!("post {}", identifier),
        author: Some("artist".to_string()),
        link: format!("https://example.org/{}", identifier),
        published_at: Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap(),
        tags: Vec::new(),
        media: media
            .iter()
            .map(|url| MediaItem {
                url: url.to_string(),
            })
            .collect(),
    }
}

struct Harness {
    registry: Arc<MemRegistry>,
    dedup: Arc<MemDedup>,
    source: Arc<ScriptedSource>,
    broadcaster: Arc<RecordingBroadcaster>,
    notifier: Arc<RecordingNotifier>,
    classifier_available: Arc<AtomicBool>,
    scheduler: Scheduler,
}

fn harness(feeds: Vec<TrackedFeed>, flagged: &[&str]) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let registry = Arc::new(MemRegistry::new(feeds));
    let dedup = Arc::new(MemDedup::new());
    let source = Arc::new(ScriptedSource::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let classifier_available = Arc::new(AtomicBool::new(true));

    let classifier = StubClassifier {
        flagged: flagged.iter().map(|f| f.to_string()).collect(),
        available: classifier_available.clone(),
    };

    let publish_config = PublishConfig {
        max_attempts: 2,
        max_rate_limit_waits: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        min_send_interval: Duration::from_millis(0),
        timeout_seconds: 5,
    };
    let scheduler_config = SchedulerConfig {
        poll_interval: Duration::from_secs(3600),
        max_concurrent_feeds: 2,
        feed_failure_alert_after: 2,
        stale_pipeline_alert_after: Duration::from_secs(3600),
    };

    let scheduler = Scheduler::new(
        registry.clone(),
        source.clone(),
        dedup.clone(),
        ModerationGate::new(Arc::new(classifier), ModerationConfig::default()),
        Dispatcher::new(broadcaster.clone(), publish_config),
        notifier.clone(),
        scheduler_config,
    );

    Harness {
        registry,
        dedup,
        source,
        broadcaster,
        notifier,
        classifier_available,
        scheduler,
    }
}

#[tokio::test]
async fn publishes_in_feed_order() {
    let feed = tracked_feed(None);
    let feed_id = feed.id;
    let h = harness(vec![feed], &[]);
    h.source
        .set_entries(
            feed_id,
            vec![
                entry(feed_id, "guid-101", 1, &["https://img/101.jpg"]),
                entry(feed_id, "guid-102", 2, &["https://img/102.jpg"]),
                entry(feed_id, "guid-103", 3, &["https://img/103.jpg"]),
            ],
        )
        .await;

    let stats = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(stats.published, 3);
    assert_eq!(
        h.broadcaster.delivered().await,
        vec!["guid-101", "guid-102", "guid-103"]
    );
    assert_eq!(h.registry.cursor_of(feed_id).await.as_deref(), Some("guid-103"));
}

#[tokio::test]
async fn blocked_entry_is_skipped_and_never_claimed() {
    // Cursor at guid-100; guid-101 is clean, guid-102 has one flagged image.
    let feed = tracked_feed(Some("guid-100"));
    let feed_id = feed.id;
    let h = harness(vec![feed], &["https://img/102-b.jpg"]);
    h.source
        .set_entries(
            feed_id,
            vec![
                entry(feed_id, "guid-100", 1, &["https://img/100.jpg"]),
                entry(feed_id, "guid-101", 2, &["https://img/101.jpg"]),
                entry(
                    feed_id,
                    "guid-102",
                    3,
                    &["https://img/102-a.jpg", "https://img/102-b.jpg"],
                ),
            ],
        )
        .await;

    let stats = h.scheduler.run_cycle().await.unwrap();
    info!("cycle stats: {:?}", stats);

    assert_eq!(h.broadcaster.delivered().await, vec!["guid-101"]);
    assert!(h.dedup.is_claimed("guid-101").await.unwrap());
    assert!(!h.dedup.is_claimed("guid-102").await.unwrap());
    // Blocked means seen-but-not-published: the cursor moves past it.
    assert_eq!(h.registry.cursor_of(feed_id).await.as_deref(), Some("guid-102"));
}

#[tokio::test]
async fn rerun_with_no_new_entries_publishes_nothing() {
    let feed = tracked_feed(None);
    let feed_id = feed.id;
    let h = harness(vec![feed], &[]);
    h.source
        .set_entries(
            feed_id,
            vec![entry(feed_id, "guid-101", 1, &["https://img/101.jpg"])],
        )
        .await;

    let first = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(first.published, 1);
    let claims_after_first = h.dedup.count().await;

    let second = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(second.published, 0);
    assert_eq!(h.dedup.count().await, claims_after_first);
    assert_eq!(h.broadcaster.delivered().await.len(), 1);
}

#[tokio::test]
async fn claimed_entry_is_not_republished_even_if_cursor_lagged() {
    // Simulates a crash after claim commit but before cursor persistence.
    let feed = tracked_feed(None);
    let feed_id = feed.id;
    let h = harness(vec![feed], &[]);
    h.dedup.try_claim("guid-101").await.unwrap();
    h.source
        .set_entries(
            feed_id,
            vec![entry(feed_id, "guid-101", 1, &["https://img/101.jpg"])],
        )
        .await;

    let stats = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(stats.published, 0);
    assert_eq!(stats.skipped, 1);
    assert!(h.broadcaster.delivered().await.is_empty());
    // The pre-filter re-advances the cursor without re-publishing.
    assert_eq!(h.registry.cursor_of(feed_id).await.as_deref(), Some("guid-101"));
}

#[tokio::test]
async fn classifier_outage_fails_closed_and_retries_next_cycle() {
    let feed = tracked_feed(None);
    let feed_id = feed.id;
    let h = harness(vec![feed], &[]);
    h.source
        .set_entries(
            feed_id,
            vec![entry(feed_id, "guid-101", 1, &["https://img/101.jpg"])],
        )
        .await;

    h.classifier_available.store(false, Ordering::SeqCst);
    let stats = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(stats.published, 0);
    assert!(h.broadcaster.delivered().await.is_empty());
    assert!(!h.dedup.is_claimed("guid-101").await.unwrap());
    assert_eq!(h.registry.cursor_of(feed_id).await, None);

    h.classifier_available.store(true, Ordering::SeqCst);
    let stats = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(h.broadcaster.delivered().await, vec!["guid-101"]);
}

#[tokio::test]
async fn concurrent_claims_yield_exactly_one_winner() {
    let dedup = Arc::new(MemDedup::new());
    let a = {
        let dedup = dedup.clone();
        tokio::spawn(async move { dedup.try_claim("guid-500").await.unwrap() })
    };
    let b = {
        let dedup = dedup.clone();
        tokio::spawn(async move { dedup.try_claim("guid-500").await.unwrap() })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    let claimed = [a, b]
        .iter()
        .filter(|o| **o == ClaimOutcome::Claimed)
        .count();
    assert_eq!(claimed, 1);
    assert_eq!(dedup.count().await, 1);
}

#[tokio::test]
async fn rate_limited_entry_is_deferred_not_lost() {
    let feed = tracked_feed(None);
    let feed_id = feed.id;
    let h = harness(vec![feed], &[]);
    h.source
        .set_entries(
            feed_id,
            vec![entry(feed_id, "guid-101", 1, &["https://img/101.jpg"])],
        )
        .await;

    h.broadcaster.set_mode(BroadcastMode::RateLimit).await;
    let stats = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(stats.published, 0);
    assert!(!h.dedup.is_claimed("guid-101").await.unwrap());
    assert_eq!(h.registry.cursor_of(feed_id).await, None);

    h.broadcaster.set_mode(BroadcastMode::Deliver).await;
    let stats = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(stats.published, 1);
}

#[tokio::test]
async fn rejected_entry_is_dropped_with_an_alert() {
    let feed = tracked_feed(None);
    let feed_id = feed.id;
    let h = harness(vec![feed], &[]);
    h.source
        .set_entries(
            feed_id,
            vec![entry(feed_id, "guid-101", 1, &["https://img/101.jpg"])],
        )
        .await;

    h.broadcaster.set_mode(BroadcastMode::Reject).await;
    let stats = h.scheduler.run_cycle().await.unwrap();

    assert_eq!(stats.published, 0);
    assert_eq!(stats.skipped, 1);
    assert!(!h.dedup.is_claimed("guid-101").await.unwrap());
    // Dropped for good: the cursor moves past it so it is not retried.
    assert_eq!(h.registry.cursor_of(feed_id).await.as_deref(), Some("guid-101"));
    let alerts = h.notifier.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("guid-101"));
}

#[tokio::test]
async fn persistent_feed_failure_raises_one_alert() {
    let feed = tracked_feed(None);
    let feed_id = feed.id;
    let h = harness(vec![feed], &[]);
    h.source.fail_feed(feed_id).await;

    for _ in 0..3 {
        let stats = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(stats.failed_feeds, 1);
    }

    // Threshold is 2 consecutive cycles; the alert fires exactly once.
    let alerts = h.notifier.alerts().await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("consecutive"));
}

#[tokio::test]
async fn one_failing_feed_does_not_block_the_others() {
    let healthy = tracked_feed(None);
    let healthy_id = healthy.id;
    let mut broken = tracked_feed(None);
    broken.url = "http://localhost:1200/pixiv/user/0".to_string();
    let broken_id = broken.id;

    let h = harness(vec![broken, healthy], &[]);
    h.source
        .set_entries(
            healthy_id,
            vec![entry(healthy_id, "guid-201", 1, &["https://img/201.jpg"])],
        )
        .await;
    h.source.fail_feed(broken_id).await;

    let stats = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(stats.failed_feeds, 1);
    assert_eq!(stats.published, 1);
    assert_eq!(h.broadcaster.delivered().await, vec!["guid-201"]);
}
