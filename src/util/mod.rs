//! Utility functions shared by the normalizer and the upserter.
//!
//! - **Link validation**: accept only absolute http(s) links that fit storage
//! - **Text processing**: whitespace/control cleanup, char-safe truncation, slugs
//!
//! # Examples
//!
//! ```
//! use newswire::util::{slugify, validate_link};
//!
//! let link = validate_link("https://example.com/story").unwrap();
//! let slug = slugify("Markets rally on rate cut");
//! assert_eq!(slug, "markets-rally-on-rate-cut");
//! # let _ = link;
//! ```

mod text;
mod url_validator;

pub use text::{
    clean_optional, clean_text, slug_with_suffix, slugify, truncate_chars, MAX_SLUG_LEN,
};
pub use url_validator::{validate_link, UrlValidationError, MAX_LINK_LEN};
