//! SQLite-backed blacklist of failing endpoints

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Executor, Row, Sqlite};
use tracing::{debug, info};

use super::models::{BlacklistEntry, BlacklistStats};
use super::timestamp;
use crate::error::Result;
use crate::proxy::parser::EndpointParser;

/// Source tag for entries imported from a flat file
pub const FLAT_SOURCE: &str = "flat";

const BUSY_TIMEOUT_MS: u64 = 5000;
const POOL_SIZE: u32 = 4;

/// Persistent set of endpoints that failed a probe, keyed by normalized key.
///
/// Every mutation is a single statement or a single transaction.
#[derive(Debug, Clone)]
pub struct BlacklistStore {
    pool: SqlitePool,
}

impl BlacklistStore {
    /// Open the store, creating the file, its directory and the schema as needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await?;

        run_migrations(&pool).await?;

        info!(path = %path.display(), "blacklist store opened");
        Ok(Self { pool })
    }

    /// Open the store only if its file exists.
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.is_file() {
            debug!(path = %path.display(), "no blacklist store file");
            return Ok(None);
        }
        Self::open(path).await.map(Some)
    }

    /// Private in-memory store (for testing)
    pub async fn in_memory() -> Result<Self> {
        // One connection that never recycles: each in-memory connection is
        // its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str(":memory:")?)
            .await?;

        run_migrations(&pool).await?;

        debug!("in-memory blacklist store created");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record a failure for `key`.
    ///
    /// A new key starts at `fail_count = 1` with both timestamps set to
    /// `observed_at` (default now). An existing key gets the new `raw` and
    /// `last_seen`, one more failure, and keeps its old source when `source`
    /// is `None`. A backdated observation also pulls `first_seen` back, so
    /// `first_seen <= last_seen` always holds. An empty key is ignored.
    pub async fn upsert(
        &self,
        key: &str,
        raw: &str,
        source: Option<&str>,
        observed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let seen_at = observed_at.map(timestamp::format).unwrap_or_else(timestamp::now);
        upsert_with(&self.pool, key, raw, source, &seen_at).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        contains_with(&self.pool, key).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<BlacklistEntry>> {
        let row = sqlx::query(
            r#"
            SELECT key, raw, first_seen, last_seen, fail_count, source
            FROM notworkers
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let first_seen: String = row.try_get("first_seen")?;
        let last_seen: String = row.try_get("last_seen")?;
        Ok(Some(BlacklistEntry {
            key: row.try_get("key")?,
            raw: row.try_get("raw")?,
            first_seen: timestamp::parse(&first_seen)?,
            last_seen: timestamp::parse(&last_seen)?,
            fail_count: row.try_get("fail_count")?,
            source: row.try_get("source")?,
        }))
    }

    /// Delete entries whose `last_seen` is older than `max_age_days`.
    ///
    /// Returns the number of deleted rows; non-positive ages delete nothing.
    pub async fn expire(&self, max_age_days: i64) -> Result<u64> {
        if max_age_days <= 0 {
            return Ok(0);
        }

        // An age reaching past the representable range keeps everything.
        let Some(cutoff) = chrono::Duration::try_days(max_age_days)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .map(timestamp::format)
        else {
            return Ok(0);
        };
        let removed = sqlx::query("DELETE FROM notworkers WHERE last_seen < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(max_age_days, %cutoff, removed, "expired blacklist entries");
        Ok(removed)
    }

    /// Delete the least recently seen entries until at most `max_rows` remain.
    ///
    /// Returns the number of deleted rows; non-positive limits delete nothing.
    pub async fn prune_to_capacity(&self, max_rows: i64) -> Result<u64> {
        if max_rows <= 0 {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notworkers")
            .fetch_one(&mut *tx)
            .await?;
        if total <= max_rows {
            return Ok(0);
        }

        let removed = sqlx::query(
            r#"
            DELETE FROM notworkers
            WHERE id IN (
                SELECT id FROM notworkers
                ORDER BY last_seen ASC, id ASC
                LIMIT ?
            )
            "#,
        )
        .bind(total - max_rows)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        debug!(max_rows, removed, "pruned blacklist to capacity");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<BlacklistStats> {
        let (total, min_first_seen, max_last_seen): (i64, Option<String>, Option<String>) =
            sqlx::query_as("SELECT COUNT(*), MIN(first_seen), MAX(last_seen) FROM notworkers")
                .fetch_one(&self.pool)
                .await?;

        Ok(BlacklistStats {
            total,
            min_first_seen,
            max_last_seen,
        })
    }

    /// Import a flat blacklist file in one transaction.
    ///
    /// Returns `(inserted, updated)`, counted by whether each key existed
    /// before its upsert. A missing file imports nothing.
    pub async fn migrate_from(&self, flat_path: impl AsRef<Path>) -> Result<(u64, u64)> {
        let flat_path = flat_path.as_ref();
        if !flat_path.is_file() {
            debug!(path = %flat_path.display(), "flat blacklist not found, nothing to migrate");
            return Ok((0, 0));
        }

        let content = std::fs::read_to_string(flat_path)?;
        let entries = EndpointParser::flat_entries(&content);
        if entries.is_empty() {
            return Ok((0, 0));
        }

        let seen_at = timestamp::now();
        let mut inserted = 0;
        let mut updated = 0;

        let mut tx = self.pool.begin().await?;
        for (key, raw) in &entries {
            if contains_with(&mut *tx, key).await? {
                updated += 1;
            } else {
                inserted += 1;
            }
            upsert_with(&mut *tx, key, raw, Some(FLAT_SOURCE), &seen_at).await?;
        }
        tx.commit().await?;

        info!(
            path = %flat_path.display(),
            inserted,
            updated,
            "migrated flat blacklist"
        );
        Ok((inserted, updated))
    }

    /// Write every stored descriptor to a flat file, ordered by key.
    pub async fn export_to(&self, flat_path: impl AsRef<Path>) -> Result<u64> {
        let flat_path = flat_path.as_ref();
        if let Some(parent) = flat_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let raws: Vec<String> = sqlx::query_scalar("SELECT raw FROM notworkers ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        EndpointParser::write_lines(flat_path, &raws)?;

        info!(path = %flat_path.display(), count = raws.len(), "exported blacklist");
        Ok(raws.len() as u64)
    }

    /// Rebuild the database file to release space freed by deletions.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    debug!("blacklist migrations completed");
    Ok(())
}

async fn upsert_with<'e, E>(
    executor: E,
    key: &str,
    raw: &str,
    source: Option<&str>,
    seen_at: &str,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    if key.is_empty() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO notworkers (key, raw, first_seen, last_seen, fail_count, source)
        VALUES (?, ?, ?, ?, 1, ?)
        ON CONFLICT(key) DO UPDATE SET
            raw = excluded.raw,
            first_seen = MIN(notworkers.first_seen, excluded.last_seen),
            last_seen = excluded.last_seen,
            fail_count = notworkers.fail_count + 1,
            source = COALESCE(excluded.source, notworkers.source)
        "#,
    )
    .bind(key)
    .bind(raw)
    .bind(seen_at)
    .bind(seen_at)
    .bind(source)
    .execute(executor)
    .await?;

    Ok(())
}

async fn contains_with<'e, E>(executor: E, key: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    if key.is_empty() {
        return Ok(false);
    }

    let found = sqlx::query("SELECT 1 FROM notworkers WHERE key = ? LIMIT 1")
        .bind(key)
        .fetch_optional(executor)
        .await?;
    Ok(found.is_some())
}
