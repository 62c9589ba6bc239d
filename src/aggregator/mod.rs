//! The synchronization core: one update cycle over the registered feeds.
//!
//! A cycle runs its phases strictly in order:
//!
//! 1. [`registry::reconcile`] brings the feed set in line with the config
//! 2. due feeds are fetched concurrently on the worker pool
//! 3. each result is merged on the calling task by [`merge::update_feed`]
//! 4. [`expiry::expire_articles`] prunes the store
//!
//! [`output::select_articles`] is the read side used by the renderer.

pub mod expiry;
pub mod merge;
pub mod output;
pub mod registry;

pub use expiry::{expire_articles, ExpiryReport};
pub use merge::{
    change_feed_url, update_feed, FeedError, FeedReport, MergeContext, RedirectError, StatusKind,
    UpdateOutcome,
};
pub use output::{select_articles, Selection};
pub use registry::{reconcile, SyncReport};

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Config;
use crate::feed::{build_request, fetch_all, select_due, FeedSource, FetchOutcome, FetchResult};
use crate::storage::AggregatorState;

/// Side channel for persisting a feed's new URL after a permanent redirect.
pub trait FeedUrlRewriter {
    /// Replace `old_url` with `new_url` wherever the feed is declared.
    fn rewrite_feed_url(&mut self, old_url: &str, new_url: &str) -> anyhow::Result<()>;
}

/// Per-feed reports plus the expiry summary for one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// One report per fetched feed, in URL order.
    pub feeds: Vec<FeedReport>,
    pub expiry: ExpiryReport,
}

impl CycleReport {
    pub fn failures(&self) -> impl Iterator<Item = &FeedReport> {
        self.feeds.iter().filter(|report| !report.is_success())
    }
}

/// Owns the configuration and the feed source for a run.
pub struct Aggregator {
    config: Config,
    source: Arc<dyn FeedSource>,
}

impl Aggregator {
    pub fn new(config: Config, source: Arc<dyn FeedSource>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconcile the registered feeds with the configured ones.
    pub fn sync(&self, state: &mut AggregatorState) -> SyncReport {
        reconcile(state, &self.config.feeds, &self.config.feed_defaults)
    }

    /// Run one fetch, merge and expire cycle.
    ///
    /// With `only` set just that feed is fetched, unconditionally.
    /// Per-feed failures are reported, never propagated.
    pub async fn update(
        &self,
        state: &mut AggregatorState,
        rewriter: &mut dyn FeedUrlRewriter,
        now: i64,
        only: Option<&str>,
    ) -> CycleReport {
        let due = select_due(state, now, only);
        let jobs = due
            .iter()
            .filter_map(|url| state.feeds.get(url))
            .map(|feed| build_request(feed, &self.config))
            .collect();

        let mut results = fetch_all(Arc::clone(&self.source), jobs, self.config.workers).await;

        let ctx = MergeContext {
            now,
            current_only: self.config.current_only,
        };
        let mut report = CycleReport::default();
        for url in &due {
            let result = results.remove(url).unwrap_or_else(|| FetchResult {
                responses: Vec::new(),
                outcome: FetchOutcome::Exception("fetch worker did not return a result".to_owned()),
            });
            report.feeds.push(update_feed(state, url, result, ctx, rewriter));
        }

        let succeeded: HashSet<String> = report
            .feeds
            .iter()
            .filter(|feed| feed.is_success())
            .map(|feed| feed.url.clone())
            .collect();
        report.expiry = expire_articles(
            state,
            &succeeded,
            now,
            self.config.expire_age,
            self.config.keep_min,
        );

        tracing::info!(
            fetched = report.feeds.len(),
            failed = report.failures().count(),
            articles = report.expiry.remaining,
            "Update cycle finished"
        );
        report
    }

    /// The articles to display right now.
    pub fn select<'a>(&self, state: &'a AggregatorState, now: i64) -> Selection<'a> {
        select_articles(state, &self.config, now)
    }
}
