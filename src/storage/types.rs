use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with operator-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another process. Stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err) || err.to_string().to_lowercase().contains("unable to open database file") {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// True for SQLite contention errors and pool exhaustion: the store is
/// momentarily unavailable rather than broken.
pub(crate) fn is_lock_error(err: &sqlx::Error) -> bool {
    if matches!(err, sqlx::Error::PoolTimedOut) {
        return true;
    }
    // SQLITE_BUSY (5): database is locked
    // SQLITE_LOCKED (6): database table is locked
    let error_string = err.to_string().to_lowercase();
    error_string.contains("database is locked")
        || error_string.contains("database table is locked")
        || error_string.contains("sqlite_busy")
        || error_string.contains("sqlite_locked")
}

// ============================================================================
// Category
// ============================================================================

/// Flat topic label carried from a feed onto each of its articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Vn,
    Global,
    Us,
    Tech,
}

impl Category {
    pub const ALL: [Category; 4] = [Category::Vn, Category::Global, Category::Us, Category::Tech];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Vn => "vn",
            Category::Global => "global",
            Category::Us => "us",
            Category::Tech => "tech",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

// ============================================================================
// Fetch Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Success,
    Partial,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::Partial => "partial",
            FetchStatus::Error => "error",
        }
    }

    pub(crate) fn from_db(s: &str) -> Self {
        match s {
            "success" => FetchStatus::Success,
            "partial" => FetchStatus::Partial,
            _ => FetchStatus::Error,
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Input Types
// ============================================================================

/// A feed as declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedSpec {
    pub name: String,
    pub url: String,
    pub category: Category,
}

/// Canonical article shape produced by the normalizer, ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedArticle {
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub link: String,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
    pub category: Category,
    pub source_name: String,
    pub source_url: String,
    /// Base slug derived from the title; the upserter may suffix it
    pub slug: String,
}

/// One fetch-run row before insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NewFetchRun {
    pub feed_name: String,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
    pub articles_found: i64,
    pub articles_processed: i64,
    pub articles_inserted: i64,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub category: String,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Result<Feed, UnknownCategory> {
        Ok(Feed {
            id: self.id,
            category: self.category.parse()?,
            name: self.name,
            url: self.url,
            is_active: self.is_active,
            created_at: from_timestamp(self.created_at),
            updated_at: self.updated_at.map(from_timestamp),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub link: String,
    pub author: Option<String>,
    pub published: Option<i64>,
    pub category: String,
    pub source_name: String,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub slug: String,
    pub is_processed: bool,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Result<Article, UnknownCategory> {
        Ok(Article {
            id: self.id,
            category: self.category.parse()?,
            title: self.title,
            summary: self.summary,
            content: self.content,
            link: self.link,
            author: self.author,
            published: self.published.map(from_timestamp),
            source_name: self.source_name,
            source_url: self.source_url,
            image_url: self.image_url,
            slug: self.slug,
            is_processed: self.is_processed,
            created_at: from_timestamp(self.created_at),
            updated_at: self.updated_at.map(from_timestamp),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FetchRunDbRow {
    pub id: i64,
    pub feed_name: String,
    pub fetched_at_ms: i64,
    pub status: String,
    pub articles_found: i64,
    pub articles_processed: i64,
    pub articles_inserted: i64,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
}

impl FetchRunDbRow {
    pub(crate) fn into_fetch_run(self) -> FetchRun {
        FetchRun {
            id: self.id,
            status: FetchStatus::from_db(&self.status),
            feed_name: self.feed_name,
            fetched_at: DateTime::from_timestamp_millis(self.fetched_at_ms).unwrap_or_default(),
            articles_found: self.articles_found,
            articles_processed: self.articles_processed,
            articles_inserted: self.articles_inserted,
            error_message: self.error_message,
            execution_time_ms: self.execution_time_ms,
        }
    }
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ============================================================================
// Data Structures
// ============================================================================

/// Registered feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub category: Category,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persisted article
///
/// `link`, `slug` and `published` never change after insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub link: String,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub category: Category,
    pub source_name: String,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub slug: String,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persisted fetch-run audit row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchRun {
    pub id: i64,
    pub feed_name: String,
    pub fetched_at: DateTime<Utc>,
    pub status: FetchStatus,
    pub articles_found: i64,
    pub articles_processed: i64,
    pub articles_inserted: i64,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
}
