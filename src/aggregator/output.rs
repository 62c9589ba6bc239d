use std::collections::HashSet;

use crate::config::Config;
use crate::storage::{AggregatorState, ArticleRecord};

/// The articles to render, newest first.
#[derive(Debug, Default)]
pub struct Selection<'a> {
    pub articles: Vec<&'a ArticleRecord>,
    /// Articles left after truncation, before the age and duplicate filters.
    pub considered: usize,
    pub duplicates: usize,
}

/// Pick and order the articles for display.
///
/// Articles are sorted newest first by [`ArticleRecord::sort_date`], ties
/// broken by feed URL, sequence and content hash. The sorted list is cut to
/// `max_articles` (0 keeps everything) and only then filtered: articles
/// older than their feed's display age limit are dropped, as are articles
/// repeating an explicit ID already shown from a feed that does not allow
/// duplicates. Filtered slots are not refilled.
pub fn select_articles<'a>(state: &'a AggregatorState, config: &Config, now: i64) -> Selection<'a> {
    let by_feed_date = config.sort_by_feed_date;

    let mut articles: Vec<&ArticleRecord> = state
        .articles
        .values()
        .filter(|article| state.feeds.contains_key(&article.feed_url))
        .collect();
    articles.sort_by(|a, b| {
        b.sort_date(by_feed_date)
            .cmp(&a.sort_date(by_feed_date))
            .then_with(|| a.feed_url.cmp(&b.feed_url))
            .then_with(|| a.sequence.cmp(&b.sequence))
            .then_with(|| a.hash.cmp(&b.hash))
    });

    if config.max_articles != 0 {
        articles.truncate(config.max_articles);
    }

    let mut selection = Selection {
        considered: articles.len(),
        ..Selection::default()
    };
    let mut seen_guids: HashSet<&str> = HashSet::new();

    for article in articles {
        let Some(feed) = state.feeds.get(&article.feed_url) else {
            continue;
        };

        let max_age = feed.max_age(config.max_age);
        if max_age != 0 && now - article.added > max_age {
            continue;
        }

        if !feed.allows_duplicates() {
            if let Some(guid) = article.guid.as_deref() {
                if !seen_guids.insert(guid) {
                    selection.duplicates += 1;
                    continue;
                }
            }
        }

        selection.articles.push(article);
    }

    tracing::debug!(
        considered = selection.considered,
        shown = selection.articles.len(),
        duplicates = selection.duplicates,
        "Selected articles for output"
    );
    selection
}
