use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::FeedOptions;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the state database
    #[error("Another instance of gleaner appears to be running. Please wait for it to finish.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The state was written by an incompatible version
    #[error("State was written by state version {found}, this build reads version {expected}. Removing the state file will fix it.")]
    StateVersion { found: i64, expected: i64 },

    /// A stored JSON column could not be decoded
    #[error("Corrupt state column: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Entry Payload
// ============================================================================

/// One block of entry text together with its declared MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// A feed entry as produced by the parser.
///
/// Every field the merge logic inspects is explicit. `author` and
/// `categories` are only carried through for the renderer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub content: Vec<ContentBlock>,
    pub summary: Option<ContentBlock>,
    pub published: Option<i64>,
    pub updated: Option<i64>,
    pub created: Option<i64>,
    pub author: Option<String>,
    pub categories: Vec<String>,
}

impl EntryInfo {
    /// The feed-supplied stable identifier, if any. Empty ids count as absent.
    pub fn explicit_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// The entry's own date: updated, else published, else created.
    pub fn date(&self) -> Option<i64> {
        self.updated.or(self.published).or(self.created)
    }

    /// Non-empty link, if any.
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref().filter(|link| !link.is_empty())
    }
}

/// Content identity of an entry within a feed.
///
/// SHA-1 over the feed URL, title, link, every content block and the summary,
/// in that order. Absent fields contribute nothing.
pub fn content_hash(feed_url: &str, entry: &EntryInfo) -> String {
    let mut hasher = Sha1::new();
    hasher.update(feed_url.as_bytes());
    if let Some(title) = &entry.title {
        hasher.update(title.as_bytes());
    }
    if let Some(link) = &entry.link {
        hasher.update(link.as_bytes());
    }
    for block in &entry.content {
        hasher.update(block.value.as_bytes());
    }
    if let Some(summary) = &entry.summary {
        hasher.update(summary.value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Last eight hex digits of the SHA-1 of `s`; short enough to type.
pub fn short_hash(s: &str) -> String {
    let digest = format!("{:x}", Sha1::digest(s.as_bytes()));
    digest[digest.len() - 8..].to_owned()
}

// ============================================================================
// Records
// ============================================================================

/// A subscribed feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub url: String,
    /// Update period in seconds.
    pub period: i64,
    /// Effective options (defaults merged with the feed's own overrides).
    pub options: FeedOptions,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Unix time of the last fetch attempt, successful or not.
    pub last_update: i64,
    /// Feed-level metadata from the last successful fetch.
    pub title: Option<String>,
    pub link: Option<String>,
}

impl FeedRecord {
    pub fn new(url: impl Into<String>, period: i64, options: FeedOptions) -> Self {
        Self {
            url: url.into(),
            period,
            options,
            etag: None,
            last_modified: None,
            last_update: 0,
            title: None,
            link: None,
        }
    }

    /// Whether the feed's period has elapsed since its last fetch attempt.
    pub fn needs_update(&self, now: i64) -> bool {
        now - self.last_update >= self.period
    }

    /// Minimum-retention floor: per-feed override, else the global default.
    pub fn keep_min(&self, default: usize) -> usize {
        self.options.keep_min.unwrap_or(default)
    }

    /// Display age limit in seconds (0 = unlimited).
    pub fn max_age(&self, default: i64) -> i64 {
        self.options.max_age.unwrap_or(default)
    }

    pub fn allows_duplicates(&self) -> bool {
        self.options.allow_duplicates.unwrap_or(false)
    }

    /// Human-readable name: the feed's title, else its link, else its URL.
    pub fn display_name(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.link.as_deref())
            .unwrap_or(&self.url)
    }

    /// Short identifier for the renderer: the `id` option, else the display
    /// name lower-cased with everything but ASCII letters and digits removed.
    pub fn display_id(&self) -> String {
        if let Some(id) = &self.options.id {
            return id.clone();
        }
        self.display_name()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect()
    }
}

/// An article in the store, keyed by its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub hash: String,
    /// URL of the owning feed.
    pub feed_url: String,
    pub entry: EntryInfo,
    /// Position within the owning feed's most recent fetch.
    pub sequence: usize,
    pub guid: Option<String>,
    pub date: Option<i64>,
    /// First-seen time.
    pub added: i64,
    pub last_seen: i64,
}

impl ArticleRecord {
    pub fn new(feed_url: &str, entry: EntryInfo, sequence: usize, now: i64) -> Self {
        Self {
            hash: content_hash(feed_url, &entry),
            feed_url: feed_url.to_owned(),
            guid: entry.explicit_id().map(str::to_owned),
            date: entry.date(),
            entry,
            sequence,
            added: now,
            last_seen: now,
        }
    }

    /// Refresh from a newer sighting of the same logical article.
    ///
    /// The key, owner and first-seen time are kept.
    pub fn update_from(&mut self, newer: ArticleRecord, now: i64) {
        self.entry = newer.entry;
        self.guid = newer.guid;
        self.sequence = newer.sequence;
        self.date = newer.date;
        self.last_seen = now;
    }

    /// Whether the article has gone unseen for longer than `expire_age`.
    pub fn can_expire(&self, now: i64, expire_age: i64) -> bool {
        now - self.last_seen > expire_age
    }

    /// Output ordering key.
    pub fn sort_date(&self, by_feed_date: bool) -> i64 {
        if by_feed_date {
            self.date.unwrap_or(self.added)
        } else {
            self.added
        }
    }
}

// ============================================================================
// Aggregator State
// ============================================================================

/// Everything that survives between runs: the feeds and their articles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorState {
    pub feeds: BTreeMap<String, FeedRecord>,
    pub articles: BTreeMap<String, ArticleRecord>,
}

impl AggregatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Articles owned by `feed_url`, in key order.
    pub fn articles_for<'a>(
        &'a self,
        feed_url: &'a str,
    ) -> impl Iterator<Item = &'a ArticleRecord> + 'a {
        self.articles
            .values()
            .filter(move |article| article.feed_url == feed_url)
    }

    /// Drop every article owned by `feed_url`; returns how many went.
    pub fn remove_articles_for(&mut self, feed_url: &str) -> usize {
        let before = self.articles.len();
        self.articles.retain(|_, article| article.feed_url != feed_url);
        before - self.articles.len()
    }
}
