//! Snapshot lookup, persistence and eviction.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{DirectorySnapshot, EntryRow, SnapshotRow, to_nanos};
use exn::{OptionExt, ResultExt};
use folio_storage::DirectoryEntry;
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::instrument;

/// Tuning for [`CacheIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOptions {
    /// Maximum number of complete snapshots kept.
    pub capacity: usize,
    /// Snapshots older than this are treated as stale even when the directory
    /// mtime still matches.
    pub ttl: Option<Duration>,
    /// How much recency a single recorded access is worth when choosing
    /// eviction victims.
    pub frequency_weight: Duration,
}
impl Default for IndexOptions {
    fn default() -> Self {
        Self { capacity: 1_000, ttl: None, frequency_weight: Duration::from_secs(60) }
    }
}

/// Outcome of [`CacheIndex::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A complete snapshot whose mtime matches the live directory.
    Hit(DirectorySnapshot),
    /// Nothing usable is stored for this path.
    Miss,
    /// A snapshot existed but the directory changed (or it expired). It has
    /// been removed.
    Stale,
    /// A snapshot existed but couldn't be decoded. It has been removed.
    Corrupted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub snapshots: u64,
    pub complete: u64,
    pub entries: u64,
}

/// SQLite-backed store of directory listings.
///
/// A snapshot is written in three steps: [`begin`](Self::begin) records the
/// directory mtime, [`append`](Self::append) adds entries batch by batch,
/// and [`complete`](Self::complete) makes it servable. Anything that goes
/// wrong in between is cleaned up with [`discard`](Self::discard).
#[derive(Debug, Clone)]
pub struct CacheIndex {
    pool: SqlitePool,
    options: IndexOptions,
}
impl CacheIndex {
    pub fn new(db: &Database, options: IndexOptions) -> Self {
        Self { pool: db.pool().clone(), options }
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    fn sqlx_hates_paths(path: impl AsRef<Path>) -> Result<String> {
        Ok(path.as_ref().to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
    }

    fn now_millis() -> i64 {
        i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Look up the snapshot for `path`, validating it against the directory's
    /// live modification time.
    ///
    /// Stale and corrupted snapshots are deleted on the way out. A hit counts
    /// as an access for eviction purposes.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn lookup(&self, path: impl AsRef<Path>, live_mtime: OffsetDateTime) -> Result<Lookup> {
        let key = Self::sqlx_hates_paths(&path)?;
        let row: Option<SnapshotRow> = sqlx::query_as(include_str!("../queries/get_snapshot.sql"))
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let Some(row) = row else {
            return Ok(Lookup::Miss);
        };
        if !row.complete {
            return Ok(Lookup::Miss);
        }
        if row.mtime != to_nanos(live_mtime)? || self.is_expired(row.scanned_at) {
            tracing::debug!("snapshot is stale");
            self.remove(&path).await?;
            return Ok(Lookup::Stale);
        }

        let entries: Vec<EntryRow> = sqlx::query_as(include_str!("../queries/get_entries.sql"))
            .bind(&key)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let mut snapshot = match row.into_snapshot(entries) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "dropping corrupted snapshot");
                self.remove(&path).await?;
                return Ok(Lookup::Corrupted);
            },
        };

        let now = Self::now_millis();
        sqlx::query(include_str!("../queries/touch_snapshot.sql"))
            .bind(&key)
            .bind(now)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        snapshot.access_count += 1;
        if let Ok(accessed) = OffsetDateTime::from_unix_timestamp_nanos(i128::from(now) * 1_000_000) {
            snapshot.last_accessed = accessed;
        }
        Ok(Lookup::Hit(snapshot))
    }

    fn is_expired(&self, scanned_at: i64) -> bool {
        let Some(ttl) = self.options.ttl else {
            return false;
        };
        let age = OffsetDateTime::now_utc().unix_timestamp().saturating_sub(scanned_at);
        age >= i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let (snapshots, complete, entries): (i64, i64, i64) =
            sqlx::query_as(include_str!("../queries/count_snapshots.sql"))
                .fetch_one(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        Ok(IndexStats {
            snapshots: u64::try_from(snapshots).unwrap_or_default(),
            complete: u64::try_from(complete).unwrap_or_default(),
            entries: u64::try_from(entries).unwrap_or_default(),
        })
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Start a new (incomplete) snapshot, replacing whatever was stored for
    /// `path` before.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn begin(&self, path: impl AsRef<Path>, mtime: OffsetDateTime) -> Result<()> {
        let key = Self::sqlx_hates_paths(&path)?;
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/delete_snapshot.sql"))
            .bind(&key)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/begin_snapshot.sql"))
            .bind(&key)
            .bind(to_nanos(mtime)?)
            .bind(now.unix_timestamp())
            .bind(Self::now_millis())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Append one batch of entries to an in-progress snapshot.
    ///
    /// Returns [`ErrorKind::NotInProgress`] when there is no incomplete
    /// snapshot for `path`.
    #[instrument(level = "trace", skip(self, path, entries), fields(path = %path.as_ref().display(), count = entries.len()))]
    pub async fn append(&self, path: impl AsRef<Path>, entries: &[DirectoryEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let key = Self::sqlx_hates_paths(&path)?;
        let rows = entries.iter().map(EntryRow::try_from).collect::<Result<Vec<_>>>()?;
        let added = i64::try_from(rows.len()).or_raise(|| ErrorKind::InvalidData("entry count"))?;

        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let total: Option<(i64,)> = sqlx::query_as(include_str!("../queries/bump_entry_count.sql"))
            .bind(&key)
            .bind(added)
            .fetch_optional(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let (total,) = total.ok_or_raise(|| ErrorKind::NotInProgress(path.as_ref().to_path_buf()))?;
        for (position, row) in (total - added..).zip(rows) {
            sqlx::query(include_str!("../queries/insert_entry.sql"))
                .bind(&key)
                .bind(position)
                .bind(row.name)
                .bind(row.kind)
                .bind(row.size)
                .bind(row.mtime)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Mark an in-progress snapshot as complete, then trim the index back to
    /// capacity.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn complete(&self, path: impl AsRef<Path>) -> Result<()> {
        let key = Self::sqlx_hates_paths(&path)?;
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query(include_str!("../queries/complete_snapshot.sql"))
            .bind(&key)
            .bind(now.unix_timestamp())
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotInProgress(path.as_ref().to_path_buf()));
        }
        self.enforce_capacity().await?;
        Ok(())
    }

    /// Throw away a snapshot, complete or not. Used when a scan fails or is
    /// cancelled part way through.
    pub async fn discard(&self, path: impl AsRef<Path>) -> Result<()> {
        self.remove(path).await.map(|_| ())
    }

    /// Store a complete listing in one go.
    pub async fn store(&self, path: impl AsRef<Path>, mtime: OffsetDateTime, entries: &[DirectoryEntry]) -> Result<()> {
        let path = path.as_ref();
        self.begin(path, mtime).await?;
        if let Err(err) = self.append(path, entries).await {
            self.discard(path).await?;
            return Err(err);
        }
        self.complete(path).await
    }

    /// Remove the snapshot for `path`. Returns whether anything was removed.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_snapshot.sql"))
            .bind(Self::sqlx_hates_paths(path)?)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/clear_snapshots.sql"))
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    /// Evict complete snapshots until no more than `capacity` remain, lowest
    /// retention score first. Returns the number evicted.
    #[instrument(level = "debug", skip(self))]
    pub async fn enforce_capacity(&self) -> Result<u64> {
        let stats = self.stats().await?;
        let capacity = u64::try_from(self.options.capacity).unwrap_or(u64::MAX);
        if stats.complete <= capacity {
            return Ok(0);
        }
        let excess = i64::try_from(stats.complete - capacity).unwrap_or(i64::MAX);
        let weight = i64::try_from(self.options.frequency_weight.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(include_str!("../queries/evict_snapshots.sql"))
            .bind(weight)
            .bind(Self::now_millis())
            .bind(excess)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tracing::debug!(evicted = result.rows_affected(), "evicted snapshots");
        Ok(result.rows_affected())
    }
}
