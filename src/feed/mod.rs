//! Feed retrieval and item normalization.
//!
//! - `parser` - RSS/Atom document → [`RawItem`]s using the `feed-rs` crate
//! - `fetcher` - one bounded HTTP retrieval + parse per feed
//! - `normalize` - [`RawItem`] → [`NormalizedArticle`](crate::storage::NormalizedArticle)
//!
//! Nothing here touches storage; the ingest pipeline wires these stages to
//! the upserter.
//!
//! # Example
//!
//! ```ignore
//! use newswire::feed::{fetch, normalize};
//!
//! let items = fetch(&client, &feed, Duration::from_secs(30)).await?;
//! for item in &items {
//!     let article = normalize(item, &feed)?;
//! }
//! ```

mod fetcher;
mod normalize;
mod parser;

pub use fetcher::{fetch, FetchError};
pub use normalize::{normalize, parse_published, DateParseFailure, NormalizeError};
pub use parser::{parse_feed, RawItem};
