use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::storage::{Database, FetchStatus, NewFetchRun};

/// Counters accumulated while a feed run progresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    /// Items the fetcher returned
    pub found: usize,
    /// Items normalized and reconciled with storage (new or duplicate)
    pub processed: usize,
    /// Items that produced a new row
    pub inserted: usize,
    /// Items that failed normalization or upsert
    pub item_failures: usize,
    /// First item-level error, kept for the audit row
    pub first_item_error: Option<String>,
    /// Failure that ended the run early (fetch error, storage down, cancel)
    pub fatal_error: Option<String>,
}

impl RunTally {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            fatal_error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn record_item_failure(&mut self, error: impl Into<String>) {
        self.item_failures += 1;
        if self.first_item_error.is_none() {
            self.first_item_error = Some(error.into());
        }
    }

    /// Message stored on the run row, if any
    pub fn error_message(&self) -> Option<String> {
        let items = match (&self.first_item_error, self.item_failures) {
            (Some(first), 1) => Some(format!("1 item failed: {first}")),
            (Some(first), n) => Some(format!("{n} items failed; first: {first}")),
            (None, _) => None,
        };
        match (&self.fatal_error, items) {
            (Some(fatal), Some(items)) => Some(format!("{fatal} ({items})")),
            (Some(fatal), None) => Some(fatal.clone()),
            (None, items) => items,
        }
    }
}

/// The only place the success/partial/error distinction is made.
///
/// - nothing processed and either a fatal error or items that all failed → `Error`
/// - everything processed, no failures, no fatal error → `Success`
/// - anything in between → `Partial`
pub fn derive_status(tally: &RunTally) -> FetchStatus {
    let processed = tally.processed.min(tally.found);
    if processed == 0 && (tally.fatal_error.is_some() || tally.found > 0) {
        FetchStatus::Error
    } else if processed == tally.found && tally.item_failures == 0 && tally.fatal_error.is_none() {
        FetchStatus::Success
    } else {
        FetchStatus::Partial
    }
}

/// Build the audit row for a finished run, clamping counts so the stored
/// row always satisfies `inserted <= processed <= found`.
pub fn build_run(
    feed_name: &str,
    started: DateTime<Utc>,
    tally: &RunTally,
    elapsed: Duration,
) -> NewFetchRun {
    let status = derive_status(tally);
    let processed = match status {
        FetchStatus::Error => 0,
        _ => tally.processed.min(tally.found),
    };

    NewFetchRun {
        feed_name: feed_name.to_string(),
        fetched_at: started,
        status,
        articles_found: tally.found as i64,
        articles_processed: processed as i64,
        articles_inserted: tally.inserted.min(processed) as i64,
        error_message: tally.error_message(),
        execution_time_ms: elapsed.as_millis().min(i64::MAX as u128) as i64,
    }
}

/// Append one fetch-run row. Never fails: a lost audit row is logged and
/// ingestion carries on.
pub async fn record_run(
    db: &Database,
    feed_name: &str,
    started: DateTime<Utc>,
    tally: &RunTally,
    elapsed: Duration,
) -> NewFetchRun {
    let run = build_run(feed_name, started, tally, elapsed);
    if let Err(e) = db.insert_fetch_run(&run).await {
        tracing::error!(
            feed = %feed_name,
            status = %run.status,
            error = %e,
            "Failed to record fetch run"
        );
    }
    run
}
