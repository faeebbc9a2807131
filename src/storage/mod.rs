mod articles;
mod feeds;
mod fetch_runs;
mod schema;
mod types;

pub use articles::ArticleInsert;
pub use schema::Database;
pub(crate) use types::is_lock_error;
pub use types::{
    Article, Category, DatabaseError, Feed, FeedSpec, FetchRun, FetchStatus, NewFetchRun,
    NormalizedArticle, UnknownCategory,
};
