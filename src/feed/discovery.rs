use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::config::FeedOptions;
use crate::feed::fetcher::{
    read_limited_bytes, FeedSource, FetchError, FetchOutcome, FetchRequest,
};
use crate::feed::scheduler::user_agent;
use crate::util::validate_absolute_url;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_DISCOVERY_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// Score of a `<link rel="alternate">` candidate. Lower sorts first.
const ALTERNATE_LINK_SCORE: u8 = 10;
/// Score of an `<a>` whose href looks like a feed.
const ANCHOR_SCORE: u8 = 20;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(link|a)\b([^>]*)>").expect("valid regex"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)([A-Za-z][A-Za-z0-9_:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid regex")
});
static FEEDISH_HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(rss|atom|rdf|feeds?)\b").expect("valid regex"));

/// Errors that can occur during feed discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The page URL is not an absolute http(s) URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// HTTP request failed
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The page answered with a non-2xx status
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 10-second timeout
    #[error("request timed out")]
    Timeout,
    /// Response body exceeded the 5MB size limit
    #[error("response too large")]
    TooLarge,
}

/// Finds the feeds a web page points at, best guess first.
///
/// The page is scanned for `<link rel="alternate">` tags (other than
/// `text/html` ones) and for `<a>` tags whose href mentions rss, atom, rdf
/// or feed(s). The page URL itself is tried last. Only candidates that
/// `source` can fetch and recognize as a feed are returned.
///
/// # Errors
///
/// Fails if the page itself cannot be retrieved. Candidates that fail are
/// silently dropped.
pub async fn discover_feeds(
    client: &reqwest::Client,
    source: &dyn FeedSource,
    page_url: &str,
) -> Result<Vec<String>, DiscoveryError> {
    let validated =
        validate_absolute_url(page_url).map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
    let page_url = validated.to_string();

    let bytes = fetch_page(client, &page_url).await?;
    let html = String::from_utf8_lossy(&bytes);

    let mut candidates = scan_page(&html, &page_url);
    candidates.push(page_url.clone());
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|url| seen.insert(url.clone()));

    let mut feeds = Vec::new();
    for candidate in candidates {
        let request = FetchRequest {
            url: candidate.clone(),
            etag: None,
            last_modified: None,
            options: FeedOptions::default(),
            disable_delta: true,
            timeout: DISCOVERY_TIMEOUT,
            user_agent: user_agent(),
        };
        match source.fetch(&request).await.outcome {
            FetchOutcome::Parsed(parsed) if parsed.format.is_some() => feeds.push(candidate),
            outcome => {
                tracing::debug!(candidate = %candidate, ?outcome, "Candidate is not a feed")
            }
        }
    }

    tracing::info!(page = %page_url, found = feeds.len(), "Feed discovery finished");
    Ok(feeds)
}

async fn fetch_page(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, DiscoveryError> {
    let response = tokio::time::timeout(DISCOVERY_TIMEOUT, client.get(url).send())
        .await
        .map_err(|_| DiscoveryError::Timeout)?
        .map_err(DiscoveryError::Network)?;

    if !response.status().is_success() {
        return Err(DiscoveryError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, MAX_DISCOVERY_SIZE)
        .await
        .map_err(|e| match e {
            FetchError::Network(e) => DiscoveryError::Network(e),
            _ => DiscoveryError::TooLarge,
        })
}

/// Candidate feed URLs in `html`, resolved against `base_url` and ordered by
/// score, then document order.
fn scan_page(html: &str, base_url: &str) -> Vec<String> {
    let mut found: Vec<(u8, String)> = Vec::new();

    for tag in TAG_RE.captures_iter(html) {
        let name = tag[1].to_ascii_lowercase();
        let attrs = parse_attrs(&tag[2]);
        let Some(href) = attrs.get("href") else {
            continue;
        };

        if name == "link"
            && attrs.get("rel").map(String::as_str) == Some("alternate")
            && attrs.get("type").map(String::as_str) != Some("text/html")
        {
            found.push((ALTERNATE_LINK_SCORE, resolve_url(href, base_url)));
        }
        if name == "a" && FEEDISH_HREF_RE.is_match(href) {
            found.push((ANCHOR_SCORE, resolve_url(href, base_url)));
        }
    }

    // Stable: equal scores keep document order.
    found.sort_by_key(|(score, _)| *score);
    found.into_iter().map(|(_, url)| url).collect()
}

/// Attributes of a tag body. Names are lower-cased; the first occurrence wins.
fn parse_attrs(body: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for cap in ATTR_RE.captures_iter(body) {
        let value = cap
            .get(2)
            .or_else(|| cap.get(3))
            .or_else(|| cap.get(4))
            .map_or("", |m| m.as_str());
        attrs
            .entry(cap[1].to_ascii_lowercase())
            .or_insert_with(|| value.to_owned());
    }
    attrs
}

/// Resolves a potentially relative URL against a base URL.
fn resolve_url(href: &str, base_url: &str) -> String {
    url::Url::parse(base_url)
        .and_then(|base| base.join(href.trim()))
        .map(|resolved| resolved.to_string())
        .unwrap_or_else(|_| href.to_owned())
}
