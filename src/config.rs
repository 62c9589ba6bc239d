//! Configuration file parser for ~/.config/gleaner/config.toml.
//!
//! The file declares the subscribed feeds plus the global scalars the
//! aggregator consumes. A missing file yields `Config::default()` (no feeds).
//! Unknown keys are accepted by serde but logged as warnings, since they are
//! usually typos.
//!
//! Time values accept either an integer or a string with a unit suffix
//! (`s`, `m`, `h`, `d`, `w`). Bare integers are minutes, except `timeout`
//! which is in seconds.
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::aggregator::FeedUrlRewriter;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A `[[feed]]` declaration is unusable (empty URL, bad period, duplicate).
    #[error("Bad feed declaration: {0}")]
    InvalidFeed(String),
}

// ============================================================================
// Time Periods
// ============================================================================

const UNITS: [(char, i64); 5] = [
    ('s', 1),
    ('m', 60),
    ('h', 3600),
    ('d', 86_400),
    ('w', 604_800),
];

/// Parse a period such as `"30m"`, `"2h"` or `"45"` into seconds.
///
/// `default_unit` applies when the value carries no suffix.
pub fn parse_period(value: &str, default_unit: char) -> Result<i64, String> {
    let value = value.trim();
    let (digits, unit) = match value.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&value[..value.len() - 1], c),
        _ => (value, default_unit),
    };
    let size = UNITS
        .iter()
        .find(|(u, _)| *u == unit.to_ascii_lowercase())
        .map(|(_, size)| *size)
        .ok_or_else(|| format!("unknown time unit '{unit}' in \"{value}\""))?;
    let count: i64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("bad time value \"{value}\""))?;
    count
        .checked_mul(size)
        .ok_or_else(|| format!("time value \"{value}\" out of range"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PeriodValue {
    Int(i64),
    Text(String),
}

impl PeriodValue {
    fn into_seconds(self, default_unit: char) -> Result<i64, String> {
        match self {
            PeriodValue::Int(n) => parse_period(&n.to_string(), default_unit),
            PeriodValue::Text(s) => parse_period(&s, default_unit),
        }
    }
}

fn de_minutes<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    PeriodValue::deserialize(d)?
        .into_seconds('m')
        .map_err(serde::de::Error::custom)
}

fn de_seconds<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    PeriodValue::deserialize(d)?
        .into_seconds('s')
        .map_err(serde::de::Error::custom)
}

/// Per-feed `max_age` is written in minutes in the config file but stored as
/// seconds; the stored form is always suffixed so it round-trips.
fn de_opt_period<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Option::<PeriodValue>::deserialize(d)?
        .map(|v| v.into_seconds('m'))
        .transpose()
        .map_err(serde::de::Error::custom)
}

fn ser_opt_period<S: serde::Serializer>(v: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(secs) => s.serialize_str(&format!("{secs}s")),
        None => s.serialize_none(),
    }
}

// ============================================================================
// Feed Options
// ============================================================================

/// Per-feed option overrides.
///
/// Appears both as the global `[feed_defaults]` table and flattened into each
/// `[[feed]]` entry. The effective options of a feed are the defaults with the
/// feed's own values layered on top (see [`FeedOptions::with_defaults`]).
///
/// Custom Debug impl masks both passwords.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedOptions {
    /// Minimum number of articles to keep regardless of age.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_min: Option<usize>,
    /// Articles first seen longer ago than this are not displayed (seconds, 0 = unlimited).
    #[serde(
        deserialize_with = "de_opt_period",
        serialize_with = "ser_opt_period",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_age: Option<i64>,
    /// Show entries sharing an explicit ID with a newer entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_duplicates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Proxy URL per scheme (`http`, `https`, `all`).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub proxies: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_password: Option<String>,
    /// Display hint; `"text"` renders descriptions preformatted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Display id override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Custom display fields handed to the renderer.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub defines: BTreeMap<String, String>,
}

impl FeedOptions {
    /// Layer these options over `defaults`; values set here win.
    pub fn with_defaults(&self, defaults: &FeedOptions) -> FeedOptions {
        let mut proxies = defaults.proxies.clone();
        proxies.extend(self.proxies.clone());
        let mut defines = defaults.defines.clone();
        defines.extend(self.defines.clone());

        FeedOptions {
            keep_min: self.keep_min.or(defaults.keep_min),
            max_age: self.max_age.or(defaults.max_age),
            allow_duplicates: self.allow_duplicates.or(defaults.allow_duplicates),
            user: self.user.clone().or_else(|| defaults.user.clone()),
            password: self.password.clone().or_else(|| defaults.password.clone()),
            proxies,
            proxy_user: self
                .proxy_user
                .clone()
                .or_else(|| defaults.proxy_user.clone()),
            proxy_password: self
                .proxy_password
                .clone()
                .or_else(|| defaults.proxy_password.clone()),
            format: self.format.clone().or_else(|| defaults.format.clone()),
            id: self.id.clone().or_else(|| defaults.id.clone()),
            defines,
        }
    }
}

impl std::fmt::Debug for FeedOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedOptions")
            .field("keep_min", &self.keep_min)
            .field("max_age", &self.max_age)
            .field("allow_duplicates", &self.allow_duplicates)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("proxies", &self.proxies)
            .field("proxy_user", &self.proxy_user)
            .field(
                "proxy_password",
                &self.proxy_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("format", &self.format)
            .field("id", &self.id)
            .field("defines", &self.defines)
            .finish()
    }
}

// ============================================================================
// Configuration Structs
// ============================================================================

fn default_period() -> i64 {
    30 * 60
}

/// One `[[feed]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedDecl {
    pub url: String,
    /// How often to fetch, in seconds.
    #[serde(default = "default_period", deserialize_with = "de_minutes")]
    pub period: i64,
    #[serde(flatten)]
    pub options: FeedOptions,
}

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of articles to display (0 = unlimited).
    pub max_articles: usize,
    /// Default display age limit in seconds (0 = unlimited).
    #[serde(deserialize_with = "de_minutes")]
    pub max_age: i64,
    /// Articles unseen for longer than this may be expired (seconds).
    #[serde(deserialize_with = "de_minutes")]
    pub expire_age: i64,
    /// Default minimum-retention floor per feed.
    pub keep_min: usize,
    /// Number of concurrent fetch workers.
    pub workers: usize,
    /// Per-request timeout in seconds.
    #[serde(deserialize_with = "de_seconds")]
    pub timeout: i64,
    /// Treat each feed's latest entry list as authoritative.
    pub current_only: bool,
    /// Order output by the feed-supplied date instead of first-seen time.
    pub sort_by_feed_date: bool,
    pub feed_defaults: FeedOptions,
    #[serde(rename = "feed")]
    pub feeds: Vec<FeedDecl>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_articles: 200,
            max_age: 0,
            expire_age: 24 * 60 * 60,
            keep_min: 0,
            workers: 4,
            timeout: 30,
            current_only: false,
            sort_by_feed_date: false,
            feed_defaults: FeedOptions::default(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "max_articles",
        "max_age",
        "expire_age",
        "keep_min",
        "workers",
        "timeout",
        "current_only",
        "sort_by_feed_date",
        "feed_defaults",
        "feed",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    /// - Bad feed declarations → `Err(ConfigError::InvalidFeed)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for decl in &self.feeds {
            if decl.url.trim().is_empty() {
                return Err(ConfigError::InvalidFeed("feed URL is empty".to_owned()));
            }
            if decl.period <= 0 {
                return Err(ConfigError::InvalidFeed(format!(
                    "period for {} must be positive",
                    decl.url
                )));
            }
            if !seen.insert(decl.url.as_str()) {
                return Err(ConfigError::InvalidFeed(format!(
                    "{} is declared more than once",
                    decl.url
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1) as u64)
    }
}

// ============================================================================
// URL Rewrite Side Channel
// ============================================================================

/// Handle on the config file that can rewrite a feed's declared URL when the
/// feed reports a permanent redirect.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace every `url = "<old>"` line with the new URL.
    ///
    /// Returns the edited text and the number of lines changed.
    fn replace_url(content: &str, old_url: &str, new_url: &str) -> (String, usize) {
        let mut out = String::with_capacity(content.len() + new_url.len());
        let mut changed = 0;

        for line in content.split_inclusive('\n') {
            let body = line.trim_end_matches(['\n', '\r']);
            let ending = &line[body.len()..];
            let matches = body.split_once('=').is_some_and(|(key, value)| {
                key.trim() == "url" && value.trim().trim_matches(['"', '\'']) == old_url
            });

            if matches {
                let indent = &body[..body.len() - body.trim_start().len()];
                out.push_str(indent);
                out.push_str("url = ");
                out.push_str(&toml::Value::String(new_url.to_owned()).to_string());
                out.push_str(ending);
                changed += 1;
            } else {
                out.push_str(line);
            }
        }

        (out, changed)
    }

    /// Write `content` next to the config file and rename it into place.
    fn write_atomically(&self, content: &str) -> anyhow::Result<()> {
        use anyhow::Context;

        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let temp_path = self.path.with_extension(format!("tmp.{suffix:016x}"));

        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create '{}'", temp_path.display()))?;

        let written = temp_file
            .write_all(content.as_bytes())
            .and_then(|()| temp_file.sync_all());
        drop(temp_file);
        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e).with_context(|| format!("Failed to write '{}'", temp_path.display()));
        }

        std::fs::rename(&temp_path, &self.path).with_context(|| {
            let _ = std::fs::remove_file(&temp_path);
            format!(
                "Failed to rename '{}' to '{}'",
                temp_path.display(),
                self.path.display()
            )
        })
    }
}

impl FeedUrlRewriter for ConfigFile {
    fn rewrite_feed_url(&mut self, old_url: &str, new_url: &str) -> anyhow::Result<()> {
        use anyhow::Context;

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read '{}'", self.path.display()))?;
        let (edited, changed) = Self::replace_url(&content, old_url, new_url);
        if changed == 0 {
            anyhow::bail!("{} is not declared in {}", old_url, self.path.display());
        }

        self.write_atomically(&edited)?;
        tracing::info!(
            path = %self.path.display(),
            old_url = %old_url,
            new_url = %new_url,
            "Rewrote feed URL in config file"
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_articles, 200);
        assert_eq!(config.max_age, 0);
        assert_eq!(config.expire_age, 86_400);
        assert_eq!(config.keep_min, 0);
        assert_eq!(config.workers, 4);
        assert_eq!(config.timeout, 30);
        assert!(!config.current_only);
        assert!(!config.sort_by_feed_date);
        assert!(config.feeds.is_empty());
    }

    #[test]
    fn test_parse_period_units() {
        assert_eq!(parse_period("30m", 'm'), Ok(1800));
        assert_eq!(parse_period("2h", 'm'), Ok(7200));
        assert_eq!(parse_period("1d", 'm'), Ok(86_400));
        assert_eq!(parse_period("1w", 'm'), Ok(604_800));
        assert_eq!(parse_period("45s", 'm'), Ok(45));
        assert_eq!(parse_period("10", 'm'), Ok(600));
        assert_eq!(parse_period("10", 's'), Ok(10));
    }

    #[test]
    fn test_parse_period_rejects_garbage() {
        assert!(parse_period("abc", 'm').is_err());
        assert!(parse_period("5y", 'm').is_err());
        assert!(parse_period("", 'm').is_err());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/gleaner_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.max_articles, 200);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
max_articles = 50
max_age = "2d"
expire_age = "12h"
keep_min = 3
workers = 8
timeout = 10
current_only = true
sort_by_feed_date = true

[feed_defaults]
allow_duplicates = true

[[feed]]
url = "https://example.com/feed.xml"
period = "1h"

[[feed]]
url = "https://example.org/atom"
period = 15
keep_min = 10
max_age = "3d"
user = "alice"
password = "secret"
proxies = { http = "http://proxy:3128" }
defines = { colour = "blue" }
"#;
        let config = Config::from_toml_str(content).unwrap();
        assert_eq!(config.max_articles, 50);
        assert_eq!(config.max_age, 2 * 86_400);
        assert_eq!(config.expire_age, 12 * 3600);
        assert_eq!(config.keep_min, 3);
        assert_eq!(config.workers, 8);
        assert_eq!(config.timeout, 10);
        assert!(config.current_only);
        assert!(config.sort_by_feed_date);
        assert_eq!(config.feed_defaults.allow_duplicates, Some(true));

        assert_eq!(config.feeds.len(), 2);
        assert_eq!(config.feeds[0].period, 3600);
        assert_eq!(config.feeds[0].options, FeedOptions::default());

        let second = &config.feeds[1];
        assert_eq!(second.period, 15 * 60);
        assert_eq!(second.options.keep_min, Some(10));
        assert_eq!(second.options.max_age, Some(3 * 86_400));
        assert_eq!(second.options.user.as_deref(), Some("alice"));
        assert_eq!(
            second.options.proxies.get("http").map(String::as_str),
            Some("http://proxy:3128")
        );
        assert_eq!(
            second.options.defines.get("colour").map(String::as_str),
            Some("blue")
        );
    }

    #[test]
    fn test_feed_period_defaults_to_thirty_minutes() {
        let config = Config::from_toml_str("[[feed]]\nurl = \"https://a.example/rss\"\n").unwrap();
        assert_eq!(config.feeds[0].period, 1800);
    }

    #[test]
    fn test_duplicate_feed_rejected() {
        let content = r#"
[[feed]]
url = "https://a.example/rss"
[[feed]]
url = "https://a.example/rss"
"#;
        let err = Config::from_toml_str(content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFeed(_)));
    }

    #[test]
    fn test_empty_url_rejected() {
        let err = Config::from_toml_str("[[feed]]\nurl = \" \"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFeed(_)));
    }

    #[test]
    fn test_zero_period_rejected() {
        let err =
            Config::from_toml_str("[[feed]]\nurl = \"https://a.example\"\nperiod = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFeed(_)));
    }

    #[test]
    fn test_bad_period_is_parse_error() {
        let err = Config::from_toml_str("expire_age = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml_str("this is not [valid toml").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_with_defaults_feed_wins() {
        let mut defaults = FeedOptions::default();
        defaults.keep_min = Some(5);
        defaults.allow_duplicates = Some(true);
        defaults.defines.insert("a".into(), "1".into());
        defaults.defines.insert("b".into(), "2".into());

        let mut own = FeedOptions::default();
        own.keep_min = Some(1);
        own.defines.insert("b".into(), "3".into());

        let merged = own.with_defaults(&defaults);
        assert_eq!(merged.keep_min, Some(1));
        assert_eq!(merged.allow_duplicates, Some(true));
        assert_eq!(merged.defines.get("a").map(String::as_str), Some("1"));
        assert_eq!(merged.defines.get("b").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_options_json_round_trip() {
        let mut options = FeedOptions::default();
        options.max_age = Some(7200);
        options.keep_min = Some(2);
        let json = serde_json::to_string(&options).unwrap();
        let back: FeedOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_debug_masks_passwords() {
        let mut options = FeedOptions::default();
        options.password = Some("hunter2".into());
        options.proxy_password = Some("proxy-secret".into());
        let debug_output = format!("{:?}", options);
        assert!(!debug_output.contains("hunter2"));
        assert!(!debug_output.contains("proxy-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_replace_url_rewrites_matching_lines_only() {
        let content = "workers = 2\n\n[[feed]]\nurl = \"https://old.example/rss\"\nperiod = \"1h\"\n\n[[feed]]\n  url = 'https://other.example/rss'\n";
        let (edited, changed) =
            ConfigFile::replace_url(content, "https://old.example/rss", "https://new.example/rss");
        assert_eq!(changed, 1);
        assert!(edited.contains("url = \"https://new.example/rss\"\n"));
        assert!(edited.contains("url = 'https://other.example/rss'"));
        assert!(!edited.contains("old.example"));
        assert!(edited.starts_with("workers = 2\n"));
    }

    #[test]
    fn test_rewrite_feed_url_updates_file() {
        let dir = std::env::temp_dir().join("gleaner_config_test_rewrite");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[[feed]]\nurl = \"https://old.example/rss\"\n").unwrap();

        let mut file = ConfigFile::new(&path);
        file.rewrite_feed_url("https://old.example/rss", "https://new.example/rss")
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.feeds[0].url, "https://new.example/rss");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rewrite_unknown_url_fails() {
        let dir = std::env::temp_dir().join("gleaner_config_test_rewrite_unknown");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[[feed]]\nurl = \"https://a.example/rss\"\n").unwrap();

        let mut file = ConfigFile::new(&path);
        assert!(file
            .rewrite_feed_url("https://missing.example/rss", "https://b.example/rss")
            .is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
