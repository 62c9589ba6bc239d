use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed as an absolute URI.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL parsed but carries no host (e.g. `mailto:` or `file:` URIs).
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// Validates that a string is an absolute URI with both a scheme and a host.
///
/// Used to vet `Location` targets of permanent redirects before a feed's URL
/// is rewritten. Relative references (`/feed`), protocol-relative references
/// (`//host/feed`) and host-less URIs are all rejected.
///
/// # Examples
///
/// ```
/// use gleaner::util::validate_absolute_url;
///
/// assert!(validate_absolute_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_absolute_url("/feed.xml").is_err());
/// assert!(validate_absolute_url("//example.com/feed.xml").is_err());
/// ```
pub fn validate_absolute_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlValidationError::MissingHost(url_str.to_owned())),
    }
}

/// Turns a bare filesystem path into a `file:` locator.
///
/// Anything containing a `:` is assumed to already carry a scheme and is
/// returned untouched, so local files and remote feeds fail the same way
/// (as transport errors) instead of through separate code paths.
pub fn normalize_locator(url: &str) -> Cow<'_, str> {
    if url.contains(':') {
        Cow::Borrowed(url)
    } else {
        Cow::Owned(format!("file:{url}"))
    }
}

/// Returns the filesystem path of a `file:` locator, or `None` for any
/// other scheme.
pub fn file_locator_path(locator: &str) -> Option<PathBuf> {
    let rest = locator.strip_prefix("file:")?;
    // file:///abs/path and file:/abs/path both name /abs/path
    let path = rest.strip_prefix("//").unwrap_or(rest);
    Some(PathBuf::from(path))
}
