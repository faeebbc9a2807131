use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use super::run_log::RunTally;
use super::runner::{finish_run, ingest, FeedRunReport};
use super::IngestSettings;
use crate::storage::{Database, Feed};

/// What one scheduling tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Feeds whose run was started, by name
    pub started: Vec<String>,
    /// Feeds that were due but still running from an earlier trigger
    pub skipped_busy: Vec<String>,
    /// Finished runs (only filled by [`Scheduler::run_once`])
    pub runs: Vec<FeedRunReport>,
}

/// Process-wide ingestion context.
///
/// Holds the storage handle, HTTP client, settings, one run token per feed
/// name and the concurrency cap. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    client: reqwest::Client,
    settings: IngestSettings,
    /// Held for the whole of a feed's run; `try_lock` failing means Running
    tokens: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Last run timestamp handed out per feed
    last_started: Mutex<HashMap<String, DateTime<Utc>>>,
    permits: Arc<Semaphore>,
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop issuing triggers, wait up to the drain timeout for in-flight
    /// runs, cancel whatever is left, and return once every run has released
    /// its feed.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Scheduler loop ended abnormally");
        }
    }
}

impl Scheduler {
    pub fn new(db: Database, client: reqwest::Client, settings: IngestSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_fetches.max(1)));
        Self {
            inner: Arc::new(Inner {
                db,
                client,
                settings,
                tokens: Mutex::new(HashMap::new()),
                last_started: Mutex::new(HashMap::new()),
                permits,
            }),
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.inner.settings
    }

    /// True while a run for this feed holds its token
    pub fn is_running(&self, feed_name: &str) -> bool {
        self.token(feed_name).try_lock().is_err()
    }

    /// Trigger every active feed once and wait for all started runs.
    ///
    /// Feeds already running (from the loop or a concurrent call) are
    /// skipped, not queued.
    pub async fn run_once(&self) -> anyhow::Result<TickReport> {
        let feeds = self.inner.db.find_active_feeds().await?;
        // No one cancels a one-shot tick
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let mut tasks = JoinSet::new();
        let mut report = self.trigger(feeds, &cancel_rx, &mut tasks);

        while let Some(joined) = tasks.join_next().await {
            if let Some(run) = reap(joined) {
                report.runs.push(run);
            }
        }
        report.runs.sort_by(|a, b| a.feed_name.cmp(&b.feed_name));
        Ok(report)
    }

    /// Start the periodic loop.
    ///
    /// The loop ticks at the shortest configured cadence; on each tick every
    /// active feed whose own cadence has elapsed is triggered. The first tick
    /// fires immediately.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run_loop(shutdown_rx));
        SchedulerHandle { shutdown_tx, join }
    }

    async fn run_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let period = self.inner.settings.base_period();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks: JoinSet<FeedRunReport> = JoinSet::new();
        let mut last_triggered: HashMap<String, Instant> = HashMap::new();

        tracing::info!(period_secs = period.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!(in_flight = tasks.len(), "Scheduler shutdown requested");
                        break;
                    }
                }
                now = ticker.tick() => {
                    let feeds = match self.inner.db.find_active_feeds().await {
                        Ok(feeds) => feeds,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to list active feeds, skipping tick");
                            continue;
                        }
                    };
                    let due = due_feeds(feeds, &last_triggered, now, &self.inner.settings);
                    for feed in &due {
                        last_triggered.insert(feed.name.clone(), now);
                    }
                    if due.is_empty() {
                        continue;
                    }
                    let report = self.trigger(due, &cancel_rx, &mut tasks);
                    tracing::debug!(
                        started = report.started.len(),
                        skipped_busy = report.skipped_busy.len(),
                        "Tick"
                    );
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    reap(joined);
                }
            }
        }

        self.drain(tasks, cancel_tx).await;
        tracing::info!("Scheduler stopped");
    }

    async fn drain(&self, mut tasks: JoinSet<FeedRunReport>, cancel_tx: watch::Sender<bool>) {
        let drain_timeout = self.inner.settings.drain_timeout;
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                drain_timeout_secs = drain_timeout.as_secs(),
                "Drain timeout elapsed, cancelling in-flight runs"
            );
            let _ = cancel_tx.send(true);
            while let Some(joined) = tasks.join_next().await {
                reap(joined);
            }
        }
    }

    /// Spawn a run for every feed whose token is free.
    fn trigger(
        &self,
        feeds: Vec<Feed>,
        cancel_rx: &watch::Receiver<bool>,
        tasks: &mut JoinSet<FeedRunReport>,
    ) -> TickReport {
        let mut report = TickReport::default();
        for feed in feeds {
            match self.token(&feed.name).try_lock_owned() {
                Ok(guard) => {
                    report.started.push(feed.name.clone());
                    tasks.spawn(self.clone().run_guarded(feed, guard, cancel_rx.clone()));
                }
                Err(_) => {
                    tracing::info!(feed = %feed.name, "Previous run still in flight, skipping trigger");
                    report.skipped_busy.push(feed.name);
                }
            }
        }
        report
    }

    /// One feed's task.
    async fn run_guarded(
        self,
        feed: Feed,
        guard: OwnedMutexGuard<()>,
        cancel_rx: watch::Receiver<bool>,
    ) -> FeedRunReport {
        let inner = &self.inner;
        let body = ingest(&inner.db, &inner.client, &inner.settings, &feed);
        self.supervise(&feed, guard, cancel_rx, body).await
    }

    /// Drive a run body to a tally, then record exactly one fetch-run row.
    ///
    /// Only the body is cancellable and panic-guarded; the row is written
    /// once, after it settles. The token guard is held until then.
    async fn supervise<F>(
        &self,
        feed: &Feed,
        _guard: OwnedMutexGuard<()>,
        cancel_rx: watch::Receiver<bool>,
        body: F,
    ) -> FeedRunReport
    where
        F: Future<Output = RunTally>,
    {
        let started = self.next_run_timestamp(&feed.name);
        let clock = std::time::Instant::now();

        let run = async {
            // The semaphore is never closed
            let _permit = self.inner.permits.clone().acquire_owned().await.ok();
            AssertUnwindSafe(body).catch_unwind().await
        };

        let tally = tokio::select! {
            result = run => match result {
                Ok(tally) => tally,
                Err(panic) => {
                    let failure = format!("Run panicked: {}", panic_message(panic.as_ref()));
                    tracing::error!(feed = %feed.name, error = %failure, "Feed run aborted");
                    RunTally::failed(failure)
                }
            },
            _ = cancelled(cancel_rx) => {
                tracing::warn!(feed = %feed.name, "Feed run cancelled during shutdown");
                RunTally::failed("Run cancelled during shutdown")
            }
        };

        finish_run(&self.inner.db, feed, started, tally, clock.elapsed()).await
    }

    fn token(&self, feed_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut tokens = self
            .inner
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.entry(feed_name.to_string()).or_default().clone()
    }

    /// Wall-clock start time, bumped past the previous run of the same feed
    /// so per-feed run timestamps are strictly increasing.
    fn next_run_timestamp(&self, feed_name: &str) -> DateTime<Utc> {
        let mut last = self
            .inner
            .last_started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();
        let started = match last.get(feed_name) {
            Some(prev) if now <= *prev => *prev + chrono::Duration::milliseconds(1),
            _ => now,
        };
        last.insert(feed_name.to_string(), started);
        started
    }
}

/// Feeds whose cadence has elapsed since their last trigger.
fn due_feeds(
    feeds: Vec<Feed>,
    last_triggered: &HashMap<String, Instant>,
    now: Instant,
    settings: &IngestSettings,
) -> Vec<Feed> {
    feeds
        .into_iter()
        .filter(|feed| match last_triggered.get(&feed.name) {
            None => true,
            Some(at) => now.saturating_duration_since(*at) >= settings.interval_for(feed.category),
        })
        .collect()
}

fn reap(joined: Result<FeedRunReport, tokio::task::JoinError>) -> Option<FeedRunReport> {
    match joined {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(error = %e, "Feed task failed to complete");
            None
        }
    }
}

async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can no longer happen
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Category, FeedSpec, FetchStatus};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><title>Story</title><link>https://wire.example/story</link></item>
</channel></rss>"#;

    fn feed(name: &str, category: Category) -> Feed {
        Feed {
            id: 0,
            name: name.to_string(),
            url: format!("https://{name}.example/rss"),
            category,
            is_active: true,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    async fn scheduler_with(specs: &[FeedSpec], settings: IngestSettings) -> (Scheduler, Database) {
        let db = Database::open(":memory:").await.unwrap();
        db.sync_feeds(specs).await.unwrap();
        (
            Scheduler::new(db.clone(), reqwest::Client::new(), settings),
            db,
        )
    }

    #[test]
    fn test_due_feeds_first_tick_fires_all() {
        let settings = IngestSettings::default();
        let feeds = vec![feed("a", Category::Us), feed("b", Category::Tech)];
        let due = due_feeds(feeds, &HashMap::new(), Instant::now(), &settings);
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn test_due_feeds_respects_category_cadence() {
        let mut settings = IngestSettings::default();
        settings.fetch_interval = Duration::from_secs(600);
        settings
            .category_intervals
            .insert(Category::Tech, Duration::from_secs(60));

        let start = Instant::now();
        let last: HashMap<String, Instant> =
            [("a".to_string(), start), ("b".to_string(), start)].into();
        let feeds = || vec![feed("a", Category::Us), feed("b", Category::Tech)];

        let due = due_feeds(feeds(), &last, start + Duration::from_secs(60), &settings);
        assert_eq!(due.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), vec!["b"]);

        let due = due_feeds(feeds(), &last, start + Duration::from_secs(600), &settings);
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn test_run_timestamps_strictly_increase() {
        let (scheduler, _db) = scheduler_with(&[], IngestSettings::default()).await;
        let mut prev = scheduler.next_run_timestamp("a");
        for _ in 0..50 {
            let next = scheduler.next_run_timestamp("a");
            assert!(next > prev);
            prev = next;
        }
    }

    #[tokio::test]
    async fn test_token_released_after_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
        let specs = [FeedSpec {
            name: "Wire".into(),
            url: format!("{}/rss", server.uri()),
            category: Category::Global,
        }];
        let (scheduler, _db) = scheduler_with(&specs, IngestSettings::default()).await;

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.started, vec!["Wire".to_string()]);
        assert!(!scheduler.is_running("Wire"));
    }

    #[tokio::test]
    async fn test_token_released_after_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        let specs = [FeedSpec {
            name: "Slow".into(),
            url: format!("{}/rss", server.uri()),
            category: Category::Us,
        }];
        let settings = IngestSettings {
            fetch_timeout: Duration::from_millis(200),
            ..IngestSettings::default()
        };
        let (scheduler, db) = scheduler_with(&specs, settings).await;

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.runs[0].status, FetchStatus::Error);
        assert!(!scheduler.is_running("Slow"));

        let runs = db.recent_runs("Slow", 1).await.unwrap();
        assert!(runs[0].error_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let specs: Vec<FeedSpec> = (0..3)
            .map(|i| FeedSpec {
                name: format!("feed-{i}"),
                url: format!("{}/rss", server.uri()),
                category: Category::Us,
            })
            .collect();
        let settings = IngestSettings {
            max_concurrent_fetches: 1,
            ..IngestSettings::default()
        };
        let (scheduler, _db) = scheduler_with(&specs, settings).await;

        let clock = std::time::Instant::now();
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.runs.len(), 3);
        // Serialized by the single permit
        assert!(clock.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_cancelled_run_records_error_and_releases_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        let specs = [FeedSpec {
            name: "Stuck".into(),
            url: format!("{}/rss", server.uri()),
            category: Category::Vn,
        }];
        let (scheduler, db) = scheduler_with(&specs, IngestSettings::default()).await;
        let feed = db.find_feed_by_name("Stuck").await.unwrap().unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let report = scheduler.trigger(vec![feed], &cancel_rx, &mut tasks);
        assert_eq!(report.started.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.is_running("Stuck"));
        cancel_tx.send(true).unwrap();

        let run = reap(tasks.join_next().await.unwrap()).unwrap();
        assert_eq!(run.status, FetchStatus::Error);
        assert!(!scheduler.is_running("Stuck"));

        let runs = db.recent_runs("Stuck", 5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(
            runs[0].error_message.as_deref(),
            Some("Run cancelled during shutdown")
        );
    }

    async fn exploding_ingest() -> RunTally {
        panic!("feed parser exploded")
    }

    #[tokio::test]
    async fn test_panicking_run_records_error_and_releases_token() {
        let (scheduler, db) = scheduler_with(&[], IngestSettings::default()).await;
        let boom = feed("boom", Category::Tech);
        let guard = scheduler.token("boom").try_lock_owned().unwrap();
        assert!(scheduler.is_running("boom"));
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let report = scheduler
            .supervise(&boom, guard, cancel_rx, exploding_ingest())
            .await;

        assert_eq!(report.status, FetchStatus::Error);
        assert!(!scheduler.is_running("boom"));

        let runs = db.recent_runs("boom", 5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, FetchStatus::Error);
        assert_eq!(
            runs[0].error_message.as_deref(),
            Some("Run panicked: feed parser exploded")
        );
    }

    #[tokio::test]
    async fn test_completed_body_records_one_row() {
        let (scheduler, db) = scheduler_with(&[], IngestSettings::default()).await;
        let quiet = feed("quiet", Category::Us);
        let guard = scheduler.token("quiet").try_lock_owned().unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let report = scheduler
            .supervise(&quiet, guard, cancel_rx, async { RunTally::default() })
            .await;

        assert_eq!(report.status, FetchStatus::Success);
        assert_eq!(db.recent_runs("quiet", 5).await.unwrap().len(), 1);
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let s: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(s.as_ref()), "bang");
        let s: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic payload");
    }
}
