use futures::StreamExt;
use regex::Regex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use std::borrow::Cow;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::config::FeedOptions;
use crate::feed::parser::{parse_feed, ParsedFeed};
use crate::util::{file_locator_path, normalize_locator};

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_REDIRECTS: usize = 10;

const ACCEPT: &str = "application/atom+xml,application/rdf+xml,application/rss+xml,\
application/feed+json,application/xml;q=0.9,text/xml;q=0.2,*/*;q=0.1";

/// Error text that means the request ran out of time, whatever layer raised it.
static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed? ?out").expect("valid regex"));

/// Errors raised while retrieving a feed document.
///
/// They never escape [`FeedSource::fetch`]; they are folded into
/// [`FetchOutcome::Timeout`] or [`FetchOutcome::Exception`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Local file could not be read
    #[error("Failed to read {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Redirect chain longer than the hop limit
    #[error("Too many redirects (more than {0})")]
    TooManyRedirects(usize),
    /// Redirect whose Location cannot be followed
    #[error("Cannot follow redirect to {0:?}")]
    BadRedirect(String),
    /// Per-feed transport settings are unusable
    #[error("Invalid transport option: {0}")]
    InvalidOption(String),
}

impl FetchError {
    fn is_timeout(&self) -> bool {
        match self {
            FetchError::Timeout(_) => true,
            FetchError::Network(e) if e.is_timeout() => true,
            _ => TIMEOUT_RE.is_match(&error_chain(self)),
        }
    }
}

/// Display an error followed by every source, `: `-separated.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

// ============================================================================
// Request / Result Types
// ============================================================================

/// One HTTP response in a fetch, in the order received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHop {
    pub url: String,
    pub status: u16,
    /// Raw `Location` header, exactly as sent by the server.
    pub location: Option<String>,
}

/// Terminal state of one fetch. Exactly one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Timeout(String),
    Exception(String),
    /// The transport completed; the document may still be degenerate.
    Parsed(ParsedFeed),
}

/// Everything the merge step learns about one feed in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub responses: Vec<ResponseHop>,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    pub fn parsed(responses: Vec<ResponseHop>, feed: ParsedFeed) -> Self {
        Self {
            responses,
            outcome: FetchOutcome::Parsed(feed),
        }
    }

    fn from_error(responses: Vec<ResponseHop>, err: FetchError) -> Self {
        let outcome = if err.is_timeout() {
            FetchOutcome::Timeout(err.to_string())
        } else {
            FetchOutcome::Exception(error_chain(&err))
        };
        Self { responses, outcome }
    }
}

/// A single feed retrieval, fully described.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Feed locator: a URL, a `file:` locator or a bare path.
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub options: FeedOptions,
    /// Ask for the whole document instead of an RFC 3229 delta.
    pub disable_delta: bool,
    /// Applies to the whole fetch, redirects and body included.
    pub timeout: Duration,
    pub user_agent: String,
}

/// Where feed documents come from.
///
/// Implementations must not panic and must not return errors: every failure
/// is reported through [`FetchOutcome`].
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult;
}

// ============================================================================
// HTTP / File Source
// ============================================================================

/// Production [`FeedSource`]: HTTP(S) through `reqwest`, `file:` locators
/// through `tokio::fs`.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
}

impl HttpFeedSource {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Self::client_builder().build()?,
        })
    }

    /// Redirects are followed by hand so each hop lands in the trace.
    fn client_builder() -> reqwest::ClientBuilder {
        reqwest::Client::builder().redirect(reqwest::redirect::Policy::none())
    }

    /// The shared client, or a dedicated one when the feed names proxies.
    fn client_for(&self, options: &FeedOptions) -> Result<Cow<'_, reqwest::Client>, FetchError> {
        if options.proxies.is_empty() {
            return Ok(Cow::Borrowed(&self.client));
        }

        let mut builder = Self::client_builder();
        for (scheme, proxy_url) in &options.proxies {
            let proxy = match scheme.as_str() {
                "http" => reqwest::Proxy::http(proxy_url),
                "https" => reqwest::Proxy::https(proxy_url),
                "all" => reqwest::Proxy::all(proxy_url),
                other => {
                    return Err(FetchError::InvalidOption(format!(
                        "unknown proxy scheme '{other}'"
                    )))
                }
            }?;
            let proxy = match (&options.proxy_user, &options.proxy_password) {
                (Some(user), password) => {
                    proxy.basic_auth(user, password.as_deref().unwrap_or(""))
                }
                (None, _) => proxy,
            };
            builder = builder.proxy(proxy);
        }
        Ok(Cow::Owned(builder.build()?))
    }

    fn request_headers(request: &FetchRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
        headers.insert(
            "a-im",
            HeaderValue::from_static(if request.disable_delta {
                "identity"
            } else {
                "feed"
            }),
        );
        if let Ok(agent) = HeaderValue::from_str(&request.user_agent) {
            headers.insert(header::USER_AGENT, agent);
        }
        if let Some(etag) = request
            .etag
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(header::IF_NONE_MATCH, etag);
        }
        if let Some(modified) = request
            .last_modified
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
        {
            headers.insert(header::IF_MODIFIED_SINCE, modified);
        }
        headers
    }

    async fn fetch_http(
        &self,
        request: &FetchRequest,
        responses: &mut Vec<ResponseHop>,
    ) -> Result<ParsedFeed, FetchError> {
        let client = self.client_for(&request.options)?;
        let headers = Self::request_headers(request);
        let mut current = request.url.clone();

        let response = loop {
            let mut builder = client
                .get(&current)
                .headers(headers.clone())
                .timeout(request.timeout);
            if let (Some(user), Some(password)) =
                (&request.options.user, &request.options.password)
            {
                builder = builder.basic_auth(user, Some(password));
            }

            let response = builder.send().await?;
            let status = response.status();
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            responses.push(ResponseHop {
                url: current.clone(),
                status: status.as_u16(),
                location: location.clone(),
            });

            let follow = status.is_redirection() && status != reqwest::StatusCode::NOT_MODIFIED;
            match location {
                Some(location) if follow => {
                    if responses.len() > MAX_REDIRECTS {
                        return Err(FetchError::TooManyRedirects(MAX_REDIRECTS));
                    }
                    let next = url::Url::parse(&current)
                        .and_then(|base| base.join(&location))
                        .map_err(|_| FetchError::BadRedirect(location.clone()))?;
                    tracing::debug!(from = %current, to = %next, status = status.as_u16(), "Following redirect");
                    current = next.to_string();
                }
                _ => break response,
            }
        };

        let etag = header_string(response.headers(), header::ETAG);
        let last_modified = header_string(response.headers(), header::LAST_MODIFIED);
        let encoding = header_string(response.headers(), header::CONTENT_TYPE)
            .as_deref()
            .and_then(charset);

        if !response.status().is_success() {
            return Ok(ParsedFeed {
                etag,
                last_modified,
                ..ParsedFeed::default()
            });
        }

        let bytes = read_limited_bytes(response, MAX_FEED_SIZE).await?;
        Ok(ParsedFeed {
            etag,
            last_modified,
            encoding,
            ..parse_feed(&bytes)
        })
    }

    async fn fetch_file(path: &Path) -> Result<ParsedFeed, FetchError> {
        let file_error = |source: std::io::Error| FetchError::File {
            path: path.display().to_string(),
            source,
        };
        let meta = tokio::fs::metadata(path).await.map_err(file_error)?;
        if meta.len() > MAX_FEED_SIZE as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
        let bytes = tokio::fs::read(path).await.map_err(file_error)?;
        Ok(parse_feed(&bytes))
    }
}

#[async_trait::async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let locator = normalize_locator(&request.url);
        let mut responses = Vec::new();

        let result = match file_locator_path(&locator) {
            Some(path) => tokio::time::timeout(request.timeout, Self::fetch_file(&path)).await,
            None => {
                tokio::time::timeout(request.timeout, self.fetch_http(request, &mut responses))
                    .await
            }
        };

        match result {
            Ok(Ok(parsed)) => FetchResult::parsed(responses, parsed),
            Ok(Err(e)) => {
                tracing::debug!(feed = %request.url, error = %e, "Fetch failed");
                FetchResult::from_error(responses, e)
            }
            Err(_) => FetchResult::from_error(responses, FetchError::Timeout(request.timeout)),
        }
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// `charset` parameter of a Content-Type value.
fn charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    })
}

pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
