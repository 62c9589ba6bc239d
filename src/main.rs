use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gleaner::aggregator::Aggregator;
use gleaner::config::{Config, ConfigFile};
use gleaner::feed::{discover_feeds, user_agent, HttpFeedSource};
use gleaner::storage::{short_hash, AggregatorState, Database, DatabaseError, LockMode};
use gleaner::util::one_line;

/// Get the default config directory path (~/.config/gleaner/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("gleaner"))
}

#[derive(Parser, Debug)]
#[command(name = "gleaner", version, about = "Personal feed aggregator")]
struct Args {
    /// Directory holding config.toml and state.db
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Fail immediately if another instance holds the state
    #[arg(long)]
    no_wait: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch due feeds, merge their articles and expire old ones
    Update {
        /// Fetch only this feed, ignoring its period
        #[arg(long, value_name = "URL")]
        feed: Option<String>,
    },
    /// List subscribed feeds
    List,
    /// Print the articles selected for display
    Show,
    /// Find the feeds a web page links to
    Discover {
        /// Page URL
        url: String,
    },
}

fn format_time(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn load_config(path: &Path) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

async fn open_state(path: &Path, lock: LockMode) -> Result<(Database, AggregatorState)> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in state path"))?;
    let db = match Database::open(path_str, lock).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open state database: {}", e)),
    };
    let state = db.load_state().await.context("Failed to load state")?;
    Ok((db, state))
}

/// Everything the state-touching commands share.
struct Session {
    aggregator: Aggregator,
    db: Database,
    state: AggregatorState,
    config_path: PathBuf,
    now: i64,
}

impl Session {
    async fn open(dir: Option<PathBuf>, lock: LockMode) -> Result<Self> {
        let dir = match dir {
            Some(dir) => dir,
            None => get_config_dir()?,
        };
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;

            // State may hold feed passwords; keep the directory user-only.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) =
                    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
                {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to set directory permissions to 0700");
                }
            }
        }

        let config_path = dir.join("config.toml");
        let config = load_config(&config_path);
        let source = Arc::new(HttpFeedSource::new().context("Failed to build HTTP client")?);
        let (db, state) = open_state(&dir.join("state.db"), lock).await?;

        Ok(Self {
            aggregator: Aggregator::new(config, source),
            db,
            state,
            config_path,
            now: Utc::now().timestamp(),
        })
    }

    async fn update(mut self, only: Option<&str>) -> Result<()> {
        self.aggregator.sync(&mut self.state);
        let mut rewriter = ConfigFile::new(&self.config_path);
        let report = self
            .aggregator
            .update(&mut self.state, &mut rewriter, self.now, only)
            .await;
        self.db
            .save_state(&self.state)
            .await
            .context("Failed to save state")?;

        for line in report.feeds.iter().flat_map(|feed| feed.diagnostics()) {
            eprintln!("{}", line);
        }
        println!(
            "Fetched {} feeds ({} failed); {} articles stored, {} expired",
            report.feeds.len(),
            report.failures().count(),
            report.expiry.remaining,
            report.expiry.expired + report.expiry.orphans
        );
        Ok(())
    }

    /// Feeds added to or removed from the config show up without an update;
    /// nothing is saved.
    fn list(mut self) {
        self.aggregator.sync(&mut self.state);
        for feed in self.state.feeds.values() {
            println!("{}", feed.url);
            println!("  ID: {}", feed.display_id());
            println!("  Hash: {}", short_hash(&feed.url));
            println!("  Title: {}", one_line(feed.title.as_deref().unwrap_or("")));
            println!("  Link: {}", feed.link.as_deref().unwrap_or(""));
            let last = if feed.last_update == 0 {
                "never".to_owned()
            } else {
                format_time(feed.last_update)
            };
            println!("  Last update: {}", last);
        }
    }

    fn show(mut self) {
        self.aggregator.sync(&mut self.state);
        let by_feed_date = self.aggregator.config().sort_by_feed_date;
        let selection = self.aggregator.select(&self.state, self.now);
        for article in &selection.articles {
            let feed_name = self
                .state
                .feeds
                .get(&article.feed_url)
                .map_or(article.feed_url.as_str(), |feed| feed.display_name());
            println!(
                "{}  [{}]  {}  {}",
                format_time(article.sort_date(by_feed_date)),
                one_line(feed_name),
                one_line(article.entry.title.as_deref().unwrap_or("(untitled)")),
                article.entry.link().unwrap_or("")
            );
        }
        tracing::debug!(
            considered = selection.considered,
            duplicates = selection.duplicates,
            "Printed selection"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let lock = if args.no_wait {
        LockMode::NoWait
    } else {
        LockMode::Wait
    };

    match args.command {
        Command::Discover { url } => discover(&url).await,
        Command::Update { feed } => Session::open(args.dir, lock).await?.update(feed.as_deref()).await,
        Command::List => {
            Session::open(args.dir, lock).await?.list();
            Ok(())
        }
        Command::Show => {
            Session::open(args.dir, lock).await?.show();
            Ok(())
        }
    }
}

async fn discover(url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent())
        .build()
        .context("Failed to build HTTP client")?;
    let source = HttpFeedSource::new().context("Failed to build HTTP client")?;

    let feeds = discover_feeds(&client, &source, url)
        .await
        .with_context(|| format!("Failed to scan {}", url))?;
    if feeds.is_empty() {
        eprintln!("No feeds found at {}", url);
        std::process::exit(1);
    }
    for feed in feeds {
        println!("{}", feed);
    }
    Ok(())
}
