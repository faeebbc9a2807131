use thiserror::Error;
use url::Url;

/// Storage width of the `link` and `image_url` columns.
pub const MAX_LINK_LEN: usize = 1000;

/// Errors that can occur during link validation.
#[derive(Error, Debug, PartialEq)]
pub enum UrlValidationError {
    /// The link was empty after trimming.
    #[error("Empty URL")]
    Empty,
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL does not fit the storage column.
    #[error("URL too long: {0} characters (max {MAX_LINK_LEN})")]
    TooLong(usize),
}

/// Validates an article or image link.
///
/// Accepts only absolute `http`/`https` URLs with a host that fit within
/// [`MAX_LINK_LEN`] characters. The input is trimmed before parsing; the
/// returned string is the trimmed input, not the re-serialized [`Url`], so
/// the dedup key matches exactly what the feed published.
///
/// # Examples
///
/// ```
/// use newswire::util::validate_link;
///
/// assert_eq!(validate_link(" https://example.com/a ").unwrap(), "https://example.com/a");
/// assert!(validate_link("javascript:alert(1)").is_err());
/// assert!(validate_link("/relative/path").is_err());
/// ```
pub fn validate_link(raw: &str) -> Result<String, UrlValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlValidationError::Empty);
    }

    let len = trimmed.chars().count();
    if len > MAX_LINK_LEN {
        return Err(UrlValidationError::TooLong(len));
    }

    let url = Url::parse(trimmed)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(trimmed.to_string()),
        _ => Err(UrlValidationError::MissingHost),
    }
}
