use crate::moderation::ModerationGate;
use crate::publisher::Dispatcher;
use crate::traits::{DedupStore, EntrySource, FeedRegistry, Notifier};
use crate::types::{
    ClaimOutcome, DispatchResult, Entry, ModerationVerdict, Result, SchedulerConfig, TrackedFeed,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Copy)]
pub struct FeedStats {
    pub published: usize,
    pub skipped: usize,
    /// True when the feed stopped at an entry that must be retried next
    /// cycle; the cursor does not pass that entry.
    pub stalled: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub feeds: usize,
    pub failed_feeds: usize,
    pub published: usize,
    pub skipped: usize,
}

enum EntryOutcome {
    Published,
    /// Fully processed without publishing; the cursor advances past it.
    Skipped,
    /// Transient condition; stop the feed here and resume next cycle.
    Stalled,
}

/// The per-feed pipeline: fetch, dedup-filter, moderate, publish, commit.
/// Shared by the scheduler's feed workers.
struct Pipeline {
    registry: Arc<dyn FeedRegistry>,
    source: Arc<dyn EntrySource>,
    dedup: Arc<dyn DedupStore>,
    gate: ModerationGate,
    dispatcher: Dispatcher,
    notifier: Arc<dyn Notifier>,
}

impl Pipeline {
    async fn notify(&self, message: &str) {
        if let Err(e) = self.notifier.alert(message).await {
            warn!("Failed to deliver alert: {}", e);
        }
    }

    /// Entries are processed strictly in fetch order; a stall stops the
    /// feed so the next cycle resumes from the last committed entry.
    async fn process_feed(&self, feed: &TrackedFeed) -> Result<FeedStats> {
        let entries = self.source.fetch_since(feed).await?;

        let mut stats = FeedStats::default();
        for entry in &entries {
            match self.process_entry(feed, entry).await? {
                EntryOutcome::Published => stats.published += 1,
                EntryOutcome::Skipped => stats.skipped += 1,
                EntryOutcome::Stalled => {
                    stats.stalled = true;
                    break;
                }
            }
        }
        Ok(stats)
    }

    async fn process_entry(&self, feed: &TrackedFeed, entry: &Entry) -> Result<EntryOutcome> {
        // Fast pre-filter; the claim after delivery stays authoritative.
        // This is also what re-advances the cursor when a previous cycle
        // crashed between claim commit and cursor persistence.
        if self.dedup.is_claimed(&entry.identifier).await? {
            debug!("Entry '{}' already published", entry.identifier);
            self.registry.advance_cursor(feed.id, &entry.identifier).await?;
            return Ok(EntryOutcome::Skipped);
        }

        if entry.media.is_empty() {
            warn!("Entry '{}' has no media, skipping", entry.identifier);
            self.registry.advance_cursor(feed.id, &entry.identifier).await?;
            return Ok(EntryOutcome::Skipped);
        }

        match self.gate.classify(entry).await {
            ModerationVerdict::Blocked { reason } => {
                info!("Entry '{}' blocked ({}), skipping", entry.identifier, reason);
                self.registry.advance_cursor(feed.id, &entry.identifier).await?;
                Ok(EntryOutcome::Skipped)
            }
            ModerationVerdict::ClassifierUnavailable { reason } => {
                warn!(
                    "Classifier unavailable ({}); stalling feed {} at '{}'",
                    reason, feed.url, entry.identifier
                );
                Ok(EntryOutcome::Stalled)
            }
            ModerationVerdict::Approved => match self.dispatcher.dispatch(entry).await? {
                DispatchResult::Delivered => {
                    match self.dedup.try_claim(&entry.identifier).await? {
                        ClaimOutcome::Claimed => {}
                        ClaimOutcome::AlreadyClaimed => warn!(
                            "Entry '{}' claimed concurrently after delivery; duplicate window",
                            entry.identifier
                        ),
                    }
                    self.registry.advance_cursor(feed.id, &entry.identifier).await?;
                    Ok(EntryOutcome::Published)
                }
                DispatchResult::RateLimitExhausted => Ok(EntryOutcome::Stalled),
                DispatchResult::RetriesExhausted { reason } => {
                    self.notify(&format!(
                        "publish retries exhausted for '{}' on {}: {}",
                        entry.identifier, feed.url, reason
                    ))
                    .await;
                    Ok(EntryOutcome::Stalled)
                }
                DispatchResult::Rejected { reason } => {
                    self.notify(&format!(
                        "entry '{}' on {} rejected by destination, dropped: {}",
                        entry.identifier, feed.url, reason
                    ))
                    .await;
                    self.registry.advance_cursor(feed.id, &entry.identifier).await?;
                    Ok(EntryOutcome::Skipped)
                }
            },
        }
    }
}

/// Interval-driven orchestrator: one polling cycle over all tracked feeds,
/// feeds processed with bounded parallelism, failures contained per feed.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    config: SchedulerConfig,
    feed_failures: Mutex<HashMap<Uuid, u32>>,
    last_success: Mutex<Instant>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn FeedRegistry>,
        source: Arc<dyn EntrySource>,
        dedup: Arc<dyn DedupStore>,
        gate: ModerationGate,
        dispatcher: Dispatcher,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                registry,
                source,
                dedup,
                gate,
                dispatcher,
                notifier,
            }),
            config,
            feed_failures: Mutex::new(HashMap::new()),
            last_success: Mutex::new(Instant::now()),
        }
    }

    /// Run cycles on the configured interval until shutdown. The shutdown
    /// signal is only honored between cycles, so in-flight publish and
    /// claim sequences always finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Scheduler started; polling every {:?}",
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(_) => *self.last_success.lock().await = Instant::now(),
                        Err(e) => error!("Cycle aborted: {}", e),
                    }
                    self.check_staleness().await;
                }
                _ = shutdown.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }
    }

    /// One complete pass over all tracked feeds.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let feeds = self.pipeline.registry.list().await?;
        info!("Starting cycle over {} feeds", feeds.len());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_feeds));
        let mut workers = JoinSet::new();
        for feed in feeds {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = pipeline.process_feed(&feed).await;
                (feed, result)
            });
        }

        let mut cycle = CycleStats::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((feed, Ok(stats))) => {
                    cycle.feeds += 1;
                    cycle.published += stats.published;
                    cycle.skipped += stats.skipped;
                    self.feed_failures.lock().await.remove(&feed.id);
                }
                Ok((feed, Err(e))) => {
                    // One feed's failure never blocks the others; zero
                    // entries this cycle, retried on the next interval.
                    cycle.feeds += 1;
                    cycle.failed_feeds += 1;
                    warn!("Feed {} failed this cycle: {}", feed.url, e);
                    self.record_failure(&feed).await;
                }
                Err(e) => {
                    cycle.failed_feeds += 1;
                    error!("Feed worker panicked: {}", e);
                }
            }
        }

        info!(
            "Cycle complete: {} published, {} skipped, {}/{} feeds failed",
            cycle.published, cycle.skipped, cycle.failed_feeds, cycle.feeds
        );
        Ok(cycle)
    }

    async fn record_failure(&self, feed: &TrackedFeed) {
        let mut failures = self.feed_failures.lock().await;
        let count = failures.entry(feed.id).or_insert(0);
        *count += 1;
        if *count == self.config.feed_failure_alert_after {
            let message = format!(
                "feed {} has failed {} consecutive cycles",
                feed.url, count
            );
            error!("{}", message);
            self.pipeline.notify(&message).await;
        }
    }

    async fn check_staleness(&self) {
        let mut last = self.last_success.lock().await;
        let elapsed = last.elapsed();
        if elapsed >= self.config.stale_pipeline_alert_after {
            self.pipeline
                .notify(&format!(
                    "pipeline has not completed a successful cycle in {:?}",
                    elapsed
                ))
                .await;
            // Rearm so the alert fires once per breach, not every tick.
            *last = Instant::now();
        }
    }
}
