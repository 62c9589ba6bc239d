//! Persistent aggregator state: feeds, articles and the single-instance lock.

mod schema;
mod state;
mod types;

pub use schema::{Database, LockMode, STATE_VERSION};
pub use types::{
    content_hash, short_hash, AggregatorState, ArticleRecord, ContentBlock, DatabaseError,
    EntryInfo, FeedRecord,
};
