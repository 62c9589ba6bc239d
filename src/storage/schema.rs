use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteLockingMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

/// Version of the on-disk state layout.
pub const STATE_VERSION: i64 = 2;

/// How `Database::open` behaves when another process holds the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Wait a few seconds for the other process to finish.
    Wait,
    /// Fail immediately with `DatabaseError::InstanceLocked`.
    NoWait,
}

impl LockMode {
    fn busy_timeout(self) -> Duration {
        match self {
            LockMode::Wait => Duration::from_secs(5),
            LockMode::NoWait => Duration::ZERO,
        }
    }
}

// ============================================================================
// Database
// ============================================================================

/// Exclusive handle on the persisted aggregator state.
///
/// The pool holds exactly one connection in SQLite's exclusive locking mode,
/// so once `open` succeeds no other process can read or write the state
/// until this handle is dropped.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open the state database, take the exclusive lock and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// lock (after waiting, in [`LockMode::Wait`]).
    pub async fn open(path: &str, lock: LockMode) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // State may carry feed credentials; keep it user-only.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() {
                let _file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(db_path)
                    .ok();
            }
        }

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .locking_mode(SqliteLockingMode::Exclusive)
            .busy_timeout(lock.busy_timeout());

        // One long-lived connection: the exclusive lock lives as long as it does.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.acquire_lock().await?;
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked") {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;

        tracing::debug!(path = %path, ?lock, "Opened state database");
        Ok(db)
    }

    /// Take SQLite's exclusive lock. In exclusive locking mode the lock is
    /// kept after the transaction ends.
    async fn acquire_lock(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        sqlx::query("BEGIN EXCLUSIVE")
            .execute(&mut *conn)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    /// Create tables if needed, atomically.
    ///
    /// All statements use `IF NOT EXISTS` / `OR IGNORE`, so re-running on an
    /// existing database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES ('state_version', ?)")
            .bind(STATE_VERSION)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                url TEXT PRIMARY KEY,
                period INTEGER NOT NULL,
                options TEXT NOT NULL,
                etag TEXT,
                last_modified TEXT,
                last_update INTEGER NOT NULL,
                title TEXT,
                link TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // No foreign key: articles of a removed feed are legal until the next
        // expiry pass cleans them up.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                hash TEXT PRIMARY KEY,
                feed_url TEXT NOT NULL,
                entry TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                guid TEXT,
                date INTEGER,
                added INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed ON articles(feed_url)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}
