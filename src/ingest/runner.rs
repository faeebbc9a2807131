use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

use super::run_log::{record_run, RunTally};
use super::upsert::{upsert, UpsertError};
use super::IngestSettings;
use crate::feed::{fetch, normalize};
use crate::storage::{Database, Feed, FetchStatus};

/// Outcome of one feed run, as recorded.
#[derive(Debug, Clone, Serialize)]
pub struct FeedRunReport {
    pub feed_name: String,
    pub status: FetchStatus,
    pub started: DateTime<Utc>,
    pub tally: RunTally,
    pub elapsed_ms: i64,
}

/// Run fetch → normalize → upsert for one feed and record the outcome.
///
/// Never fails: every error is folded into the returned report and the
/// fetch-run row.
pub async fn run_feed(
    db: &Database,
    client: &reqwest::Client,
    settings: &IngestSettings,
    feed: &Feed,
    started: DateTime<Utc>,
) -> FeedRunReport {
    let clock = Instant::now();
    let tally = ingest(db, client, settings, feed).await;
    finish_run(db, feed, started, tally, clock.elapsed()).await
}

/// Record a finished run's single fetch-run row and log its outcome.
pub(crate) async fn finish_run(
    db: &Database,
    feed: &Feed,
    started: DateTime<Utc>,
    tally: RunTally,
    elapsed: Duration,
) -> FeedRunReport {
    let run = record_run(db, &feed.name, started, &tally, elapsed).await;

    match run.status {
        FetchStatus::Error => tracing::warn!(
            feed = %feed.name,
            error = run.error_message.as_deref().unwrap_or_default(),
            elapsed_ms = run.execution_time_ms,
            "Feed run failed"
        ),
        status => tracing::info!(
            feed = %feed.name,
            status = %status,
            found = tally.found,
            inserted = tally.inserted,
            failed = tally.item_failures,
            elapsed_ms = run.execution_time_ms,
            "Feed run complete"
        ),
    }

    FeedRunReport {
        feed_name: feed.name.clone(),
        status: run.status,
        started,
        tally,
        elapsed_ms: run.execution_time_ms,
    }
}

/// Fetch, normalize and upsert without recording anything.
pub(crate) async fn ingest(
    db: &Database,
    client: &reqwest::Client,
    settings: &IngestSettings,
    feed: &Feed,
) -> RunTally {
    let items = match fetch(client, feed, settings.fetch_timeout).await {
        Ok(items) => items,
        Err(e) => {
            tracing::debug!(feed = %feed.name, kind = e.kind(), error = %e, "Fetch failed");
            return RunTally::failed(e.to_string());
        }
    };

    let mut tally = RunTally {
        found: items.len(),
        ..RunTally::default()
    };

    // Document order, one at a time: slug tie-breaks depend on it
    for item in &items {
        let article = match normalize(item, feed) {
            Ok(article) => article,
            Err(e) => {
                tracing::debug!(feed = %feed.name, error = %e, "Skipping item");
                tally.record_item_failure(e.to_string());
                continue;
            }
        };

        match upsert(db, &article, settings).await {
            Ok(outcome) => {
                tally.processed += 1;
                if outcome.is_new() {
                    tally.inserted += 1;
                }
            }
            Err(e @ UpsertError::StorageUnavailable { .. }) => {
                tally.record_item_failure(e.to_string());
                tally.fatal_error = Some(e.to_string());
                break;
            }
            Err(e) => {
                tracing::warn!(feed = %feed.name, link = %article.link, error = %e, "Upsert failed");
                tally.record_item_failure(e.to_string());
            }
        }
    }

    tally
}
