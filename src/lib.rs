//! Scheduled news feed ingestion into SQLite.
//!
//! Feeds are read from the configuration, synced into the `feeds` table, and
//! fetched on a cadence. Every item is normalized, deduplicated by link, and
//! stored with a unique slug; every run leaves one `fetch_runs` audit row.

pub mod config;
pub mod feed;
pub mod ingest;
pub mod storage;
pub mod util;
