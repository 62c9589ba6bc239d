use sqlx::QueryBuilder;
use std::collections::BTreeMap;

use super::schema::{Database, STATE_VERSION};
use super::types::{AggregatorState, ArticleRecord, DatabaseError, FeedRecord};

/// Rows per multi-value INSERT. SQLite's default limit is 999 parameters and
/// the widest row binds 8 columns.
const BATCH_SIZE: usize = 100;

type FeedRow = (
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    i64,
    Option<String>,
    Option<String>,
);

#[derive(Debug, sqlx::FromRow)]
struct ArticleRow {
    hash: String,
    feed_url: String,
    entry: String,
    sequence: i64,
    guid: Option<String>,
    date: Option<i64>,
    added: i64,
    last_seen: i64,
}

impl ArticleRow {
    fn into_record(self) -> Result<ArticleRecord, DatabaseError> {
        Ok(ArticleRecord {
            hash: self.hash,
            feed_url: self.feed_url,
            entry: serde_json::from_str(&self.entry)?,
            sequence: usize::try_from(self.sequence).unwrap_or(0),
            guid: self.guid,
            date: self.date,
            added: self.added,
            last_seen: self.last_seen,
        })
    }
}

impl Database {
    // ========================================================================
    // State Load / Save
    // ========================================================================

    /// Load the complete aggregator state.
    ///
    /// A fresh database yields an empty state.
    ///
    /// # Errors
    ///
    /// `DatabaseError::StateVersion` if the file was written by an
    /// incompatible layout; `DatabaseError::Corrupt` if a JSON column fails
    /// to decode.
    pub async fn load_state(&self) -> Result<AggregatorState, DatabaseError> {
        let (version,): (i64,) =
            sqlx::query_as("SELECT value FROM meta WHERE key = 'state_version'")
                .fetch_one(&self.pool)
                .await?;
        if version != STATE_VERSION {
            return Err(DatabaseError::StateVersion {
                found: version,
                expected: STATE_VERSION,
            });
        }

        let feed_rows: Vec<FeedRow> = sqlx::query_as(
            r#"
            SELECT url, period, options, etag, last_modified, last_update, title, link
            FROM feeds
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut feeds = BTreeMap::new();
        for (url, period, options, etag, last_modified, last_update, title, link) in feed_rows {
            let record = FeedRecord {
                url: url.clone(),
                period,
                options: serde_json::from_str(&options)?,
                etag,
                last_modified,
                last_update,
                title,
                link,
            };
            feeds.insert(url, record);
        }

        let article_rows: Vec<ArticleRow> = sqlx::query_as(
            r#"
            SELECT hash, feed_url, entry, sequence, guid, date, added, last_seen
            FROM articles
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut articles = BTreeMap::new();
        for row in article_rows {
            let record = row.into_record()?;
            articles.insert(record.hash.clone(), record);
        }

        tracing::debug!(
            feeds = feeds.len(),
            articles = articles.len(),
            "Loaded aggregator state"
        );
        Ok(AggregatorState { feeds, articles })
    }

    /// Replace the persisted state with `state`.
    ///
    /// Everything happens in one transaction: a crash leaves either the old
    /// state or the new one, never a mix.
    pub async fn save_state(&self, state: &AggregatorState) -> Result<(), DatabaseError> {
        let feed_options: Vec<String> = state
            .feeds
            .values()
            .map(|feed| serde_json::to_string(&feed.options))
            .collect::<Result<_, _>>()?;
        let article_entries: Vec<String> = state
            .articles
            .values()
            .map(|article| serde_json::to_string(&article.entry))
            .collect::<Result<_, _>>()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM articles").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM feeds").execute(&mut *tx).await?;

        let feeds: Vec<(&FeedRecord, &String)> =
            state.feeds.values().zip(feed_options.iter()).collect();
        for chunk in feeds.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO feeds (url, period, options, etag, last_modified, last_update, title, link) ",
            );
            builder.push_values(chunk, |mut b, (feed, options)| {
                b.push_bind(&feed.url)
                    .push_bind(feed.period)
                    .push_bind(*options)
                    .push_bind(&feed.etag)
                    .push_bind(&feed.last_modified)
                    .push_bind(feed.last_update)
                    .push_bind(&feed.title)
                    .push_bind(&feed.link);
            });
            builder.build().execute(&mut *tx).await?;
        }

        let articles: Vec<(&ArticleRecord, &String)> = state
            .articles
            .values()
            .zip(article_entries.iter())
            .collect();
        for chunk in articles.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO articles (hash, feed_url, entry, sequence, guid, date, added, last_seen) ",
            );
            builder.push_values(chunk, |mut b, (article, entry)| {
                b.push_bind(&article.hash)
                    .push_bind(&article.feed_url)
                    .push_bind(*entry)
                    .push_bind(article.sequence as i64)
                    .push_bind(&article.guid)
                    .push_bind(article.date)
                    .push_bind(article.added)
                    .push_bind(article.last_seen);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            feeds = state.feeds.len(),
            articles = state.articles.len(),
            "Saved aggregator state"
        );
        Ok(())
    }
}
