//! Configuration file parser for `newswire.toml`.
//!
//! The config file is optional — a missing file yields `Config::default()`,
//! which has no feeds. Unknown keys are accepted but logged as warnings so
//! typos in tunables do not go unnoticed.
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::storage::{Category, FeedSpec};
use crate::util::validate_link;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// Parsed fine but a value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// What to do when a run meets a link that is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Leave the stored article untouched
    #[default]
    Skip,
    /// Update content and image URL; link, slug and published date stay fixed
    Refresh,
}

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Overridden by `--database`.
    pub database_path: PathBuf,

    /// User-Agent sent with every feed request.
    pub user_agent: String,

    /// Default cadence between runs of the same feed, in minutes.
    pub fetch_interval_minutes: u64,

    /// Per-category cadence overrides, in minutes.
    pub category_intervals: HashMap<Category, u64>,

    /// Deadline for one feed retrieval (connect + body), in seconds.
    pub fetch_timeout_secs: u64,

    /// Deadline for one storage write, in seconds.
    pub write_timeout_secs: u64,

    /// Extra slug candidates tried after the base slug is taken.
    pub max_slug_retries: u32,

    /// Maximum feeds fetched at the same time.
    pub max_concurrent_fetches: usize,

    /// Retries for a storage write that found the database busy.
    pub storage_retries: u32,

    /// How long shutdown waits for in-flight runs before cancelling them, in seconds.
    pub drain_timeout_secs: u64,

    /// Behaviour for links that are already stored.
    pub on_duplicate: DuplicatePolicy,

    /// Registered feeds, synced into the registry at startup.
    pub feeds: Vec<FeedSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("newswire.db"),
            user_agent: format!("newswire/{}", env!("CARGO_PKG_VERSION")),
            fetch_interval_minutes: 30,
            category_intervals: HashMap::new(),
            fetch_timeout_secs: 30,
            write_timeout_secs: 5,
            max_slug_retries: 5,
            max_concurrent_fetches: 10,
            storage_retries: 3,
            drain_timeout_secs: 30,
            on_duplicate: DuplicatePolicy::Skip,
            feeds: Vec::new(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 12] = [
        "database_path",
        "user_agent",
        "fetch_interval_minutes",
        "category_intervals",
        "fetch_timeout_secs",
        "write_timeout_secs",
        "max_slug_retries",
        "max_concurrent_fetches",
        "storage_retries",
        "drain_timeout_secs",
        "on_duplicate",
        "feeds",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Out-of-range values or bad feeds → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to bound memory use
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            interval_minutes = config.fetch_interval_minutes,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.fetch_interval_minutes == 0 {
            return invalid("fetch_interval_minutes must be at least 1".into());
        }
        if let Some((category, _)) = self.category_intervals.iter().find(|(_, m)| **m == 0) {
            return invalid(format!("category_intervals.{category} must be at least 1"));
        }
        if self.fetch_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return invalid("timeouts must be at least 1 second".into());
        }
        if self.max_concurrent_fetches == 0 {
            return invalid("max_concurrent_fetches must be at least 1".into());
        }

        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if feed.name.trim().is_empty() {
                return invalid(format!("feed with url {} has an empty name", feed.url));
            }
            if !seen.insert(feed.name.as_str()) {
                return invalid(format!("duplicate feed name: {}", feed.name));
            }
            if let Err(e) = validate_link(&feed.url) {
                return invalid(format!("feed {}: {e}", feed.name));
            }
        }
        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        minutes(self.fetch_interval_minutes)
    }

    /// Cadence for one category, falling back to the default interval
    pub fn interval_for(&self, category: Category) -> Duration {
        self.category_intervals
            .get(&category)
            .copied()
            .map(minutes)
            .unwrap_or_else(|| self.fetch_interval())
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

// ============================================================================
// Tests
// ============================================================================
