//! gleaner keeps a deduplicated article store in sync with a set of feeds.
//!
//! - [`config`] - TOML configuration and the feed-URL rewrite side channel
//! - [`storage`] - Records and the SQLite-backed state
//! - [`feed`] - Parsing, fetching, the worker pool and discovery
//! - [`aggregator`] - Registry sync, merge, expiry and output selection
//! - [`util`] - URL and text helpers

pub mod aggregator;
pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
