use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

use crate::feed::parser::{parse_feed, RawItem};
use crate::storage::Feed;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while retrieving and parsing one feed.
///
/// None of these are fatal to the scheduler: each becomes an `error`
/// fetch-run row for the feed that produced it.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The per-feed deadline elapsed before the document was read
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
}

impl FetchError {
    /// Short machine-friendly kind, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Network(_) | FetchError::HttpStatus(_) | FetchError::ResponseTooLarge => {
                "network"
            }
            FetchError::Timeout(_) => "timeout",
            FetchError::Parse(_) => "parse",
        }
    }
}

/// Retrieve and parse one feed.
///
/// A single deadline covers connect, headers and body, so a server that
/// trickles bytes cannot hold the feed's slot past `timeout`. Performs no
/// deduplication and no category inference; items come back in document
/// order.
///
/// # Errors
///
/// - [`FetchError::Timeout`] - `timeout` elapsed
/// - [`FetchError::Network`] - connection or TLS failure
/// - [`FetchError::HttpStatus`] - non-2xx response
/// - [`FetchError::ResponseTooLarge`] - body over 10MB
/// - [`FetchError::Parse`] - not a valid RSS/Atom document
pub async fn fetch(
    client: &reqwest::Client,
    feed: &Feed,
    timeout: Duration,
) -> Result<Vec<RawItem>, FetchError> {
    let bytes = tokio::time::timeout(timeout, download(client, &feed.url))
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;

    parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))
}

async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).send().await?;

    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, MAX_FEED_SIZE).await
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
