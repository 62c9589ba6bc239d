//! Per-feed update: classify a fetch result, follow permanent redirects and
//! merge entries into the article store.
//!
//! Classification runs in a fixed priority order and the first rule that
//! matches decides the outcome:
//!
//! 1. a leading chain of 301s moves the feed to the last hop's target
//!    (or fails the feed if the target is missing or not absolute)
//! 2. timeout, 3. transport/parse exception
//! 4. 304 is a successful no-op
//! 5. 403/410 means the feed is gone, 6. any other non-2xx is an error
//! 7. no recognized format and no entries is unrecognized content
//! 8. zero entries is a successful no-op
//! 9. otherwise the entries are merged
//!
//! The feed's `last_update` advances whatever the outcome.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::FeedUrlRewriter;
use crate::feed::{FetchOutcome, FetchResult, ParsedFeed};
use crate::storage::{AggregatorState, ArticleRecord};
use crate::util::validate_absolute_url;

// ============================================================================
// Error Types
// ============================================================================

/// Why an HTTP status failed a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// 403 or 410: the publisher no longer serves this feed.
    Gone,
    /// Any other non-2xx status.
    Error,
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusKind::Gone => {
                f.write_str("the feed has gone; you should remove it from your config file")
            }
            StatusKind::Error => f.write_str(
                "the feed returned an error; if this persists, you should remove it from your config file",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedirectError {
    #[error("The feed returned a permanent redirect, but without a new location")]
    Missing,
    #[error("The feed returned a permanent redirect, but with an invalid new location: {0}")]
    Invalid(String),
}

/// A per-feed failure. Never aborts the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("Timeout while reading feed")]
    Timeout,

    #[error("Error fetching or parsing feed: {0}")]
    Transport(String),

    #[error("HTTP {status}: {kind}")]
    HttpStatus { status: u16, kind: StatusKind },

    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error("The data retrieved from this URL could not be understood as a feed")]
    UnrecognizedContent,
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 304, or a normal response without entries. Counts as success.
    Unchanged,
    /// Entries were merged.
    Updated {
        added: usize,
        refreshed: usize,
        /// Dropped by currently-published-only mode.
        removed: usize,
    },
    Failed(FeedError),
}

/// Result of updating one feed, for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedReport {
    /// The feed's URL after any redirect.
    pub url: String,
    /// Set when a permanent redirect moved the feed.
    pub previous_url: Option<String>,
    /// Status of the last response, 0 if unknown.
    pub last_status: u16,
    pub outcome: UpdateOutcome,
    /// Informational lines (redirect notices, rewrite failures).
    pub notes: Vec<String>,
}

impl FeedReport {
    /// Whether the feed counts as successfully updated for expiry.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, UpdateOutcome::Failed(_))
    }

    pub fn error(&self) -> Option<&FeedError> {
        match &self.outcome {
            UpdateOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Operator-facing lines for a feed with notes or an error, each
    /// prefixed by the feed as it was configured and the last HTTP status.
    /// Empty for a plain success.
    pub fn diagnostics(&self) -> Vec<String> {
        let feed = self.previous_url.as_deref().unwrap_or(&self.url);
        let prefix = match self.last_status {
            0 => feed.to_owned(),
            status => format!("{feed} (HTTP {status})"),
        };
        self.notes
            .iter()
            .map(|note| format!("{prefix}: {note}"))
            .chain(self.error().map(|error| format!("{prefix}: {error}")))
            .collect()
    }

    fn emit(&self) {
        if self.notes.is_empty() && self.is_success() {
            tracing::debug!(feed = %self.url, outcome = ?self.outcome, "Feed updated");
            return;
        }
        let feed = self.previous_url.as_deref().unwrap_or(&self.url);
        let status = (self.last_status != 0).then_some(self.last_status);
        for note in &self.notes {
            tracing::warn!(feed = %feed, status = ?status, "{}", note);
        }
        if let Some(error) = self.error() {
            tracing::warn!(feed = %feed, status = ?status, error = %error, "Feed update failed");
        }
    }
}

/// Settings the merge step reads.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext {
    pub now: i64,
    /// Drop articles the latest fetch no longer lists.
    pub current_only: bool,
}

// ============================================================================
// Update
// ============================================================================

/// Status of the last response; when there was none (a local file), 200 if
/// the document had any content.
fn last_status(result: &FetchResult) -> u16 {
    match (result.responses.last(), &result.outcome) {
        (Some(hop), _) => hop.status,
        (None, FetchOutcome::Parsed(feed)) if feed.has_content() => 200,
        (None, _) => 0,
    }
}

/// Move a feed to `new_url`, re-owning its articles.
///
/// A failing `rewriter` is recorded in `notes` but does not stop the move.
///
/// # Errors
///
/// Refuses (and leaves everything untouched) when `new_url` is already
/// subscribed.
pub fn change_feed_url(
    state: &mut AggregatorState,
    old_url: &str,
    new_url: &str,
    rewriter: &mut dyn FeedUrlRewriter,
    notes: &mut Vec<String>,
) -> Result<(), String> {
    if state.feeds.contains_key(new_url) {
        return Err(format!(
            "New feed URL {new_url} is already subscribed; remove {old_url} from the config file by hand"
        ));
    }
    let Some(mut feed) = state.feeds.remove(old_url) else {
        return Err(format!("{old_url} is not subscribed"));
    };

    match rewriter.rewrite_feed_url(old_url, new_url) {
        Ok(()) => notes.push("The config file has been updated automatically".to_owned()),
        Err(e) => notes.push(format!("Could not update the config file: {e:#}")),
    }

    feed.url = new_url.to_owned();
    state.feeds.insert(new_url.to_owned(), feed);
    let mut moved = 0;
    for article in state.articles.values_mut() {
        if article.feed_url == old_url {
            article.feed_url = new_url.to_owned();
            moved += 1;
        }
    }
    tracing::info!(old_url = %old_url, new_url = %new_url, articles = moved, "Feed moved");
    Ok(())
}

/// Apply one feed's fetch result to `state`.
///
/// `url` must name a registered feed.
pub fn update_feed(
    state: &mut AggregatorState,
    url: &str,
    result: FetchResult,
    ctx: MergeContext,
    rewriter: &mut dyn FeedUrlRewriter,
) -> FeedReport {
    let mut report = FeedReport {
        url: url.to_owned(),
        previous_url: None,
        last_status: last_status(&result),
        outcome: UpdateOutcome::Unchanged,
        notes: Vec::new(),
    };

    match state.feeds.get_mut(url) {
        Some(feed) => feed.last_update = ctx.now,
        None => {
            report.outcome = UpdateOutcome::Failed(FeedError::Transport(
                "feed is not subscribed".to_owned(),
            ));
            report.emit();
            return report;
        }
    }

    report.outcome = match classify(state, &mut report, result, ctx, rewriter) {
        Ok(outcome) => outcome,
        Err(e) => UpdateOutcome::Failed(e),
    };
    report.emit();
    report
}

fn classify(
    state: &mut AggregatorState,
    report: &mut FeedReport,
    result: FetchResult,
    ctx: MergeContext,
    rewriter: &mut dyn FeedUrlRewriter,
) -> Result<UpdateOutcome, FeedError> {
    let redirects = result
        .responses
        .iter()
        .take_while(|hop| hop.status == 301)
        .last();
    if let Some(hop) = redirects {
        let location = hop.location.as_deref().ok_or(RedirectError::Missing)?;
        validate_absolute_url(location)
            .map_err(|_| RedirectError::Invalid(location.to_owned()))?;

        report.notes.push(format!("The feed has moved permanently to {location}"));
        match change_feed_url(state, &report.url, location, rewriter, &mut report.notes) {
            Ok(()) => {
                report.previous_url = Some(std::mem::replace(&mut report.url, location.to_owned()));
            }
            Err(e) => report.notes.push(e),
        }
    }

    let parsed = match result.outcome {
        FetchOutcome::Timeout(_) => return Err(FeedError::Timeout),
        FetchOutcome::Exception(cause) => return Err(FeedError::Transport(cause)),
        FetchOutcome::Parsed(parsed) => parsed,
    };

    match report.last_status {
        304 => return Ok(UpdateOutcome::Unchanged),
        status @ (403 | 410) => {
            return Err(FeedError::HttpStatus {
                status,
                kind: StatusKind::Gone,
            })
        }
        status if !(200..300).contains(&status) => {
            return Err(FeedError::HttpStatus {
                status,
                kind: StatusKind::Error,
            })
        }
        _ => {}
    }

    if parsed.format.is_none() && parsed.entries.is_empty() {
        return Err(FeedError::UnrecognizedContent);
    }
    // Treated like a 304 even in currently-published-only mode.
    if parsed.entries.is_empty() {
        return Ok(UpdateOutcome::Unchanged);
    }

    Ok(merge_entries(state, &report.url, parsed, ctx))
}

/// Rule 9: store the feed metadata and merge every entry.
fn merge_entries(
    state: &mut AggregatorState,
    url: &str,
    parsed: ParsedFeed,
    ctx: MergeContext,
) -> UpdateOutcome {
    if let Some(feed) = state.feeds.get_mut(url) {
        feed.etag = parsed.etag;
        feed.last_modified = parsed.last_modified;
        feed.title = parsed.title;
        feed.link = parsed.link;
    }

    // Explicit id -> key of this feed's existing record, fixed before merging.
    let by_id: HashMap<String, String> = state
        .articles_for(url)
        .filter_map(|a| a.guid.clone().map(|id| (id, a.hash.clone())))
        .collect();

    let mut seen = HashSet::new();
    let (mut added, mut refreshed) = (0, 0);
    for (sequence, entry) in parsed.entries.into_iter().enumerate() {
        let article = ArticleRecord::new(url, entry, sequence, ctx.now);
        seen.insert(article.hash.clone());

        let existing = article
            .guid
            .as_ref()
            .and_then(|id| by_id.get(id))
            .cloned()
            .or_else(|| {
                state
                    .articles
                    .contains_key(&article.hash)
                    .then(|| article.hash.clone())
            });

        match existing.and_then(|key| state.articles.get_mut(&key)) {
            Some(record) => {
                record.update_from(article, ctx.now);
                refreshed += 1;
            }
            None => {
                state.articles.insert(article.hash.clone(), article);
                added += 1;
            }
        }
    }

    // Keyed by the hashes this fetch produced, so a record kept alive only by
    // its explicit id goes once its content changes.
    let mut removed = 0;
    if ctx.current_only {
        let before = state.articles.len();
        state
            .articles
            .retain(|key, a| a.feed_url != url || seen.contains(key));
        removed = before - state.articles.len();
    }

    UpdateOutcome::Updated {
        added,
        refreshed,
        removed,
    }
}
