use anyhow::Result;
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser;

use crate::feed::normalize::parse_published;

/// One item as it appeared in the feed document, before normalization.
///
/// Every field is optional and untrimmed: deciding what is usable is the
/// normalizer's job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    /// Publication time as RFC 3339 text; absent when the item carries no
    /// date or one no known format accepts
    pub published: Option<String>,
    pub image: Option<String>,
}

/// Parse an RSS or Atom document into raw items, in document order.
///
/// Dates are read with [`parse_published`] rather than feed-rs's own
/// timestamp parser, so every format the normalizer accepts survives parsing.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<RawItem>> {
    let feed = parser::Builder::new()
        .timestamp_parser(feed_timestamp)
        .build()
        .parse(bytes)?;
    Ok(feed.entries.into_iter().map(raw_item).collect())
}

fn feed_timestamp(text: &str) -> Option<DateTime<Utc>> {
    match parse_published(text) {
        Ok(dt) => Some(dt),
        Err(e) => {
            tracing::debug!(error = %e, "Dropping unparseable feed date");
            None
        }
    }
}

fn raw_item(entry: Entry) -> RawItem {
    let image = image_reference(&entry);

    // Prefer the alternate link; fall back to the first non-enclosure link
    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("alternate"))
        .or_else(|| {
            entry
                .links
                .iter()
                .find(|l| l.rel.as_deref() != Some("enclosure"))
        })
        .map(|l| l.href.clone())
        .filter(|href| !href.trim().is_empty())
        // RSS items often carry their permalink only as <guid>. feed-rs
        // fills `id` from the guid or a generated hash; the normalizer
        // rejects anything that is not an http(s) URL.
        .or_else(|| Some(entry.id.clone()).filter(|id| looks_like_url(id)));

    RawItem {
        title: entry.title.map(|t| t.content),
        link,
        summary: entry.summary.map(|s| s.content),
        content: entry.content.and_then(|c| c.body),
        author: entry.authors.into_iter().next().map(|p| p.name),
        published: entry.published.or(entry.updated).map(|dt| dt.to_rfc3339()),
        image,
    }
}

fn looks_like_url(id: &str) -> bool {
    let id = id.trim_start();
    id.starts_with("http://") || id.starts_with("https://")
}

/// First image-like reference: media thumbnail, image media content, then an
/// image enclosure.
fn image_reference(entry: &Entry) -> Option<String> {
    let thumbnail = entry
        .media
        .iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| t.image.uri.clone())
        .next();
    if thumbnail.is_some() {
        return thumbnail;
    }

    let media_image = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .filter(|c| {
            c.content_type
                .as_ref()
                .map(|ct| ct.to_string().starts_with("image/"))
                .unwrap_or(false)
        })
        .find_map(|c| c.url.as_ref().map(|u| u.to_string()));
    if media_image.is_some() {
        return media_image;
    }

    entry
        .links
        .iter()
        .find(|l| {
            l.rel.as_deref() == Some("enclosure")
                && l.media_type
                    .as_deref()
                    .map(|t| t.starts_with("image/"))
                    .unwrap_or(false)
        })
        .map(|l| l.href.clone())
}
