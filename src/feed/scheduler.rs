//! Due-feed selection and the bounded fetch worker pool.
//!
//! Jobs go into one work channel up front. Each worker claims jobs from it
//! until it is empty and sends results down its own output channel. The
//! caller joins every worker and only then drains the output channels, so
//! the results map is complete (and independent of the worker count) when
//! [`fetch_all`] returns.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::config::Config;
use crate::feed::fetcher::{FeedSource, FetchRequest, FetchResult};
use crate::storage::{AggregatorState, FeedRecord};

pub fn user_agent() -> String {
    format!("gleaner/{}", env!("CARGO_PKG_VERSION"))
}

/// URLs of the feeds to fetch this cycle, in URL order.
///
/// With `only` set, that single feed is due regardless of its period and its
/// validators are cleared so the server sends the full document. An unknown
/// `only` URL selects nothing.
pub fn select_due(state: &mut AggregatorState, now: i64, only: Option<&str>) -> Vec<String> {
    match only {
        Some(url) => match state.feeds.get_mut(url) {
            Some(feed) => {
                feed.etag = None;
                feed.last_modified = None;
                vec![feed.url.clone()]
            }
            None => {
                tracing::warn!(feed = %url, "Not subscribed to feed, nothing to update");
                Vec::new()
            }
        },
        None => state
            .feeds
            .values()
            .filter(|feed| feed.needs_update(now))
            .map(|feed| feed.url.clone())
            .collect(),
    }
}

/// Build the conditional request for one feed.
pub fn build_request(feed: &FeedRecord, config: &Config) -> FetchRequest {
    FetchRequest {
        url: feed.url.clone(),
        etag: feed.etag.clone(),
        last_modified: feed.last_modified.clone(),
        options: feed.options.clone(),
        // A delta would look like most entries vanished.
        disable_delta: feed.keep_min(config.keep_min) == 0 || config.current_only,
        timeout: config.request_timeout(),
        user_agent: user_agent(),
    }
}

/// Fetch every job on a pool of `workers` tasks and collect the results by URL.
///
/// The pool size is clamped to `1..=jobs.len()`. A job whose worker panicked
/// has no entry in the returned map.
pub async fn fetch_all(
    source: Arc<dyn FeedSource>,
    jobs: Vec<FetchRequest>,
    workers: usize,
) -> HashMap<String, FetchResult> {
    if jobs.is_empty() {
        return HashMap::new();
    }

    let total = jobs.len();
    let worker_count = workers.max(1).min(total);

    let (work_tx, work_rx) = mpsc::unbounded_channel();
    for job in jobs {
        // Receiver is alive, so this cannot fail.
        let _ = work_tx.send(job);
    }
    drop(work_tx);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let mut set = JoinSet::new();
    let mut outputs = Vec::with_capacity(worker_count);
    for worker in 0..worker_count {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<(String, FetchResult)>();
        outputs.push(out_rx);

        let source = Arc::clone(&source);
        let work_rx = Arc::clone(&work_rx);
        set.spawn(async move {
            loop {
                let job = work_rx.lock().await.recv().await;
                let Some(job) = job else { break };

                tracing::debug!(worker = worker, feed = %job.url, "Fetching feed");
                let result = source.fetch(&job).await;
                if out_tx.send((job.url, result)).is_err() {
                    break;
                }
            }
        });
    }

    tracing::info!(feeds = total, workers = worker_count, "Fetching feeds");

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "Fetch worker died");
        }
    }

    let mut results = HashMap::with_capacity(total);
    for mut rx in outputs {
        while let Ok((url, result)) = rx.try_recv() {
            results.insert(url, result);
        }
    }
    results
}
