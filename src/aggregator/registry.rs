use crate::config::{FeedDecl, FeedOptions};
use crate::storage::{AggregatorState, FeedRecord};

/// What [`reconcile`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    /// Feeds whose period or effective options changed.
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    /// Articles dropped along with removed feeds.
    pub articles_removed: usize,
}

impl SyncReport {
    /// Whether the state was mutated and needs saving.
    pub fn is_dirty(&self) -> bool {
        !(self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty())
    }
}

/// Bring the feed set in `state` in line with the declared feeds.
///
/// Declared URLs that are new get a fresh [`FeedRecord`]; known ones take
/// the declared period and the declared options layered over `defaults`.
/// Feeds no longer declared are dropped together with their articles.
/// Running it again with the same declarations changes nothing.
pub fn reconcile(
    state: &mut AggregatorState,
    declared: &[FeedDecl],
    defaults: &FeedOptions,
) -> SyncReport {
    let mut report = SyncReport::default();

    for decl in declared {
        let options = decl.options.with_defaults(defaults);

        let Some(feed) = state.feeds.get_mut(&decl.url) else {
            tracing::info!(feed = %decl.url, "Adding new feed");
            state.feeds.insert(
                decl.url.clone(),
                FeedRecord::new(decl.url.clone(), decl.period, options),
            );
            report.added.push(decl.url.clone());
            continue;
        };

        let mut changed = false;
        if feed.period != decl.period {
            tracing::info!(feed = %decl.url, old = feed.period, new = decl.period, "Changed feed period");
            feed.period = decl.period;
            changed = true;
        }
        if feed.options != options {
            tracing::info!(feed = %decl.url, "Changed feed options");
            feed.options = options;
            changed = true;
        }
        if changed {
            report.changed.push(decl.url.clone());
        }
    }

    let stale: Vec<String> = state
        .feeds
        .keys()
        .filter(|url| !declared.iter().any(|decl| &decl.url == *url))
        .cloned()
        .collect();
    for url in stale {
        let articles = state.remove_articles_for(&url);
        state.feeds.remove(&url);
        tracing::info!(feed = %url, articles = articles, "Removing feed");
        report.articles_removed += articles;
        report.removed.push(url);
    }

    report
}
