use std::collections::{HashMap, HashSet};

use crate::storage::AggregatorState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Articles whose feed is no longer registered.
    pub orphans: usize,
    pub expired: usize,
    pub remaining: usize,
}

/// Prune the article store after a cycle.
///
/// Orphans always go. Beyond that only feeds in `succeeded` are touched:
/// their articles are walked oldest first (first-seen time, then sequence,
/// then hash) and an article is removed when it has gone unseen for longer
/// than `expire_age` and its feed still holds more than its `keep_min`
/// floor. The floor is checked against the running count, so a walk never
/// takes a feed below it.
pub fn expire_articles(
    state: &mut AggregatorState,
    succeeded: &HashSet<String>,
    now: i64,
    expire_age: i64,
    default_keep_min: usize,
) -> ExpiryReport {
    let mut report = ExpiryReport::default();

    let feeds = &state.feeds;
    let before = state.articles.len();
    state.articles.retain(|_, article| {
        let registered = feeds.contains_key(&article.feed_url);
        if !registered {
            tracing::debug!(feed = %article.feed_url, article = %article.hash, "Expired article for removed feed");
        }
        registered
    });
    report.orphans = before - state.articles.len();

    let mut live: HashMap<String, usize> = HashMap::new();
    for article in state.articles.values() {
        *live.entry(article.feed_url.clone()).or_default() += 1;
    }

    let mut candidates: Vec<(i64, usize, String)> = state
        .articles
        .values()
        .filter(|article| succeeded.contains(&article.feed_url))
        .map(|article| (article.added, article.sequence, article.hash.clone()))
        .collect();
    candidates.sort();

    for (_, _, key) in candidates {
        let Some(article) = state.articles.get(&key) else {
            continue;
        };
        let Some(feed) = state.feeds.get(&article.feed_url) else {
            continue;
        };
        let floor = feed.keep_min(default_keep_min);
        let Some(count) = live.get_mut(&article.feed_url) else {
            continue;
        };

        if article.can_expire(now, expire_age) && *count > floor {
            *count -= 1;
            state.articles.remove(&key);
            report.expired += 1;
        }
    }

    report.remaining = state.articles.len();
    tracing::info!(
        expired = report.expired + report.orphans,
        remaining = report.remaining,
        "Expired articles"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedOptions;
    use crate::storage::{ArticleRecord, EntryInfo, FeedRecord};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const A: &str = "https://a.example/rss";
    const B: &str = "https://b.example/rss";

    fn state_with(feeds: &[(&str, Option<usize>)]) -> AggregatorState {
        let mut state = AggregatorState::new();
        for (url, keep_min) in feeds {
            let options = FeedOptions {
                keep_min: *keep_min,
                ..FeedOptions::default()
            };
            state
                .feeds
                .insert((*url).to_owned(), FeedRecord::new(*url, 1800, options));
        }
        state
    }

    fn add(state: &mut AggregatorState, feed: &str, title: &str, added: i64, last_seen: i64) -> String {
        let entry = EntryInfo {
            title: Some(title.to_owned()),
            ..EntryInfo::default()
        };
        let mut article = ArticleRecord::new(feed, entry, 0, added);
        article.last_seen = last_seen;
        let key = article.hash.clone();
        state.articles.insert(key.clone(), article);
        key
    }

    fn succeeded(urls: &[&str]) -> HashSet<String> {
        urls.iter().map(|u| (*u).to_owned()).collect()
    }

    #[test]
    fn test_orphans_always_removed() {
        let mut state = state_with(&[(A, None)]);
        add(&mut state, A, "kept", 100, 10_000);
        add(&mut state, "https://gone.example/rss", "orphan", 100, 10_000);

        let report = expire_articles(&mut state, &HashSet::new(), 10_000, 86_400, 0);

        assert_eq!(report.orphans, 1);
        assert_eq!(report.expired, 0);
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn test_old_articles_expire_only_for_succeeded_feeds() {
        let mut state = state_with(&[(A, None), (B, None)]);
        add(&mut state, A, "a-old", 0, 0);
        let fresh = add(&mut state, A, "a-fresh", 0, 99_000);
        add(&mut state, B, "b-old", 0, 0);

        let report = expire_articles(&mut state, &succeeded(&[A]), 100_000, 86_400, 0);

        assert_eq!(report.expired, 1);
        assert!(state.articles.contains_key(&fresh));
        assert!(state.articles.values().any(|a| a.feed_url == B));
    }

    #[test]
    fn test_age_must_exceed_expire_age() {
        let mut state = state_with(&[(A, None)]);
        add(&mut state, A, "edge", 0, 1000);
        expire_articles(&mut state, &succeeded(&[A]), 1000 + 86_400, 86_400, 0);
        assert_eq!(state.articles.len(), 1);
    }

    #[test]
    fn test_floor_keeps_newest() {
        let mut state = state_with(&[(A, Some(2))]);
        add(&mut state, A, "oldest", 1, 0);
        add(&mut state, A, "older", 2, 0);
        let newer = add(&mut state, A, "newer", 3, 0);
        let newest = add(&mut state, A, "newest", 4, 0);

        let report = expire_articles(&mut state, &succeeded(&[A]), 1_000_000, 86_400, 0);

        assert_eq!(report.expired, 2);
        let mut kept: Vec<&String> = state.articles.keys().collect();
        kept.sort();
        let mut expected = vec![&newer, &newest];
        expected.sort();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_global_floor_applies_without_override() {
        let mut state = state_with(&[(A, None), (B, Some(0))]);
        for i in 0..3 {
            add(&mut state, A, &format!("a{i}"), i, 0);
            add(&mut state, B, &format!("b{i}"), i, 0);
        }

        expire_articles(&mut state, &succeeded(&[A, B]), 1_000_000, 86_400, 1);

        assert_eq!(state.articles_for(A).count(), 1);
        assert_eq!(state.articles_for(B).count(), 0);
    }

    proptest! {
        #[test]
        fn prop_expiry_respects_floor_and_gate(
            articles in prop::collection::vec((0usize..3, 0i64..100, 0i64..200), 0..40),
            floors in prop::collection::vec(prop::option::of(0usize..5), 3),
            succeeded_mask in prop::collection::vec(any::<bool>(), 3),
            global_floor in 0usize..4,
        ) {
            let urls = ["https://f0.example/rss", "https://f1.example/rss", "https://f2.example/rss"];
            let mut state = state_with(&[(urls[0], floors[0]), (urls[1], floors[1]), (urls[2], floors[2])]);
            for (i, (feed, added, last_seen)) in articles.iter().enumerate() {
                add(&mut state, urls[*feed], &format!("t{i}"), *added, *last_seen);
            }
            let ok: HashSet<String> = urls
                .iter()
                .zip(&succeeded_mask)
                .filter(|(_, ok)| **ok)
                .map(|(u, _)| (*u).to_owned())
                .collect();
            let before = state.clone();

            expire_articles(&mut state, &ok, 250, 100, global_floor);

            for (i, url) in urls.iter().enumerate() {
                let had = before.articles_for(url).count();
                let has = state.articles_for(url).count();
                if !ok.contains(*url) {
                    prop_assert_eq!(has, had);
                } else {
                    let floor = floors[i].unwrap_or(global_floor);
                    prop_assert!(has >= had.min(floor));
                }
            }
            // Nothing still fresh is ever removed.
            for (key, article) in &before.articles {
                if 250 - article.last_seen <= 100 {
                    prop_assert!(state.articles.contains_key(key));
                }
            }
        }
    }
}
