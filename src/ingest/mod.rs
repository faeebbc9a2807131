//! Scheduled ingestion: fetch → normalize → upsert → record, per feed.
//!
//! - `upsert` - link-keyed dedup with slug collision resolution
//! - `run_log` - status derivation and the append-only fetch-run audit row
//! - `runner` - one complete run for one feed
//! - `scheduler` - cadence, per-feed overlap prevention, bounded fan-out, drain
//!
//! Failures never cross a feed boundary: whatever happens inside one feed's
//! run ends up as that feed's fetch-run row.

mod run_log;
mod runner;
mod scheduler;
mod upsert;

use std::collections::HashMap;
use std::time::Duration;

use crate::config::{Config, DuplicatePolicy};
use crate::storage::Category;

pub use run_log::{build_run, derive_status, record_run, RunTally};
pub use runner::{run_feed, FeedRunReport};
pub use scheduler::{Scheduler, SchedulerHandle, TickReport};
pub use upsert::{slug_candidate, upsert, UpsertError, UpsertOutcome};

/// Runtime tunables for the pipeline, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub fetch_interval: Duration,
    pub category_intervals: HashMap<Category, Duration>,
    pub fetch_timeout: Duration,
    pub write_timeout: Duration,
    pub max_slug_retries: u32,
    pub max_concurrent_fetches: usize,
    pub storage_retries: u32,
    /// First backoff delay for a busy database; doubles per retry
    pub storage_backoff: Duration,
    pub drain_timeout: Duration,
    pub on_duplicate: DuplicatePolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for IngestSettings {
    fn from(config: &Config) -> Self {
        Self {
            fetch_interval: config.fetch_interval(),
            category_intervals: Category::ALL
                .into_iter()
                .filter(|c| config.category_intervals.contains_key(c))
                .map(|c| (c, config.interval_for(c)))
                .collect(),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            max_slug_retries: config.max_slug_retries,
            max_concurrent_fetches: config.max_concurrent_fetches.max(1),
            storage_retries: config.storage_retries,
            storage_backoff: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            on_duplicate: config.on_duplicate,
        }
    }
}

impl IngestSettings {
    pub fn interval_for(&self, category: Category) -> Duration {
        self.category_intervals
            .get(&category)
            .copied()
            .unwrap_or(self.fetch_interval)
    }

    /// Scheduler tick period: the shortest cadence any feed can have
    pub fn base_period(&self) -> Duration {
        self.category_intervals
            .values()
            .copied()
            .fold(self.fetch_interval, Duration::min)
    }
}
