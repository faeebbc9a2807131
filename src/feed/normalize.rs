use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::feed::parser::RawItem;
use crate::storage::{Feed, NormalizedArticle};
use crate::util::{
    clean_optional, clean_text, slugify, truncate_chars, validate_link, UrlValidationError,
};

/// Storage width of the `title` column, also used for derived summaries.
const MAX_TITLE_LEN: usize = 500;
const MAX_DERIVED_SUMMARY_LEN: usize = 500;
const UNTITLED: &str = "Untitled";

/// Per-item failure. Counted by the run, never fatal to it.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    /// The item has no link, or one that cannot serve as a dedup key
    #[error("Item has no usable link: {0}")]
    MissingLink(#[from] UrlValidationError),
}

/// A published-date string none of the known formats accept.
///
/// Non-fatal: the article is stored with no published date.
#[derive(Debug, Error, PartialEq)]
#[error("Unrecognized date format: {0:?}")]
pub struct DateParseFailure(pub String);

/// Convert a raw item into the canonical article shape.
///
/// Deterministic and side-effect-free apart from a debug log line when the
/// published date cannot be parsed.
pub fn normalize(raw: &RawItem, feed: &Feed) -> Result<NormalizedArticle, NormalizeError> {
    let link = validate_link(raw.link.as_deref().unwrap_or_default())?;

    let title = clean_optional(raw.title.as_deref())
        .map(|t| truncate_chars(&t, MAX_TITLE_LEN).to_string())
        .unwrap_or_else(|| UNTITLED.to_string());

    let content = raw
        .content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let summary = clean_optional(raw.summary.as_deref()).or_else(|| {
        content
            .as_deref()
            .map(clean_text)
            .filter(|c| !c.is_empty())
            .map(|c| truncate_chars(&c, MAX_DERIVED_SUMMARY_LEN).to_string())
    });

    let published = raw.published.as_deref().and_then(|s| match parse_published(s) {
        Ok(dt) => Some(dt),
        Err(e) => {
            tracing::debug!(feed = %feed.name, link = %link, error = %e, "Dropping unparseable published date");
            None
        }
    });

    let image_url = raw
        .image
        .as_deref()
        .and_then(|i| validate_link(i).ok());

    Ok(NormalizedArticle {
        slug: slugify(&title),
        title,
        summary,
        content,
        link,
        author: clean_optional(raw.author.as_deref()),
        published,
        image_url,
        category: feed.category,
        source_name: feed.name.clone(),
        source_url: feed.url.clone(),
    })
}

/// Best-effort parse of a feed date into UTC.
///
/// Accepts RFC 3339, RFC 2822 (including the obsolete zone names RSS feeds
/// still use), `YYYY-MM-DD HH:MM:SS` with or without a numeric offset, and a
/// bare `YYYY-MM-DD`. Strings without an offset are taken as UTC.
pub fn parse_published(s: &str) -> Result<DateTime<Utc>, DateParseFailure> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }

    Err(DateParseFailure(s.to_string()))
}
