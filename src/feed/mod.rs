//! Feed retrieval: parsing, fetching, scheduling and discovery.
//!
//! - [`parser`] - Reduces RSS/Atom/JSON documents to [`ParsedFeed`] using `feed-rs`
//! - [`fetcher`] - The [`FeedSource`] seam and its HTTP/file implementation
//! - [`scheduler`] - Due-feed selection and the bounded worker pool
//! - [`discovery`] - Finds the feeds a web page links to
//!
//! # Example
//!
//! ```ignore
//! use gleaner::feed::{build_request, fetch_all, HttpFeedSource};
//!
//! let source = Arc::new(HttpFeedSource::new()?);
//! let jobs = feeds.iter().map(|f| build_request(f, &config)).collect();
//! let results = fetch_all(source, jobs, config.workers).await;
//! ```

pub mod discovery;
pub mod fetcher;
pub mod parser;
pub mod scheduler;

pub use discovery::{discover_feeds, DiscoveryError};
pub use fetcher::{
    FeedSource, FetchError, FetchOutcome, FetchRequest, FetchResult, HttpFeedSource, ResponseHop,
};
pub use parser::{parse_feed, ParsedFeed};
pub use scheduler::{build_request, fetch_all, select_due, user_agent};
