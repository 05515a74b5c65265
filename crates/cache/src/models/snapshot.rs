use crate::error::{Error, ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use folio_storage::{DirectoryEntry, EntryKind};
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;

/// The persisted listing of one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    /// Directory path, relative to the storage root
    pub path: PathBuf,
    /// Directory modification time when the listing was taken
    pub mtime: OffsetDateTime,
    /// Unfiltered listing, in scan order
    pub entries: Vec<DirectoryEntry>,
    pub scanned_at: OffsetDateTime,
    /// Incomplete snapshots are partial scans and never served
    pub complete: bool,
    pub access_count: u64,
    pub last_accessed: OffsetDateTime,
}

pub(crate) fn to_nanos(timestamp: OffsetDateTime) -> Result<i64> {
    i64::try_from(timestamp.unix_timestamp_nanos()).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

pub(crate) fn from_nanos(nanos: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).or_raise(|| ErrorKind::InvalidData("timestamp"))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SnapshotRow {
    pub(crate) path: String,
    pub(crate) mtime: i64,
    pub(crate) scanned_at: i64,
    pub(crate) complete: bool,
    pub(crate) entry_count: i64,
    pub(crate) access_count: i64,
    pub(crate) last_accessed: i64,
}
impl SnapshotRow {
    /// Combine the header row with its entries. Any inconsistency means the
    /// stored snapshot can't be trusted.
    pub(crate) fn into_snapshot(self, entries: Vec<EntryRow>) -> Result<DirectorySnapshot> {
        let path = PathBuf::from(&self.path);
        let corrupted = || ErrorKind::SnapshotCorrupted(path.clone());
        if usize::try_from(self.entry_count).ok() != Some(entries.len()) {
            exn::bail!(corrupted());
        }
        let entries = entries
            .into_iter()
            .map(|row| row.into_entry(&path))
            .collect::<Result<Vec<_>>>()
            .or_raise(corrupted)?;
        Ok(DirectorySnapshot {
            mtime: from_nanos(self.mtime).or_raise(corrupted)?,
            scanned_at: OffsetDateTime::from_unix_timestamp(self.scanned_at).or_raise(corrupted)?,
            complete: self.complete,
            access_count: u64::try_from(self.access_count).or_raise(corrupted)?,
            last_accessed: OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.last_accessed) * 1_000_000)
                .or_raise(corrupted)?,
            entries,
            path,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) size: i64,
    pub(crate) mtime: i64,
}
impl EntryRow {
    fn into_entry(self, parent: &Path) -> Result<DirectoryEntry> {
        // A stored name is exactly one path component.
        let mut components = Path::new(&self.name).components();
        let single = matches!((components.next(), components.next()), (Some(Component::Normal(_)), None));
        if !single {
            exn::bail!(ErrorKind::InvalidData("entry name"));
        }
        let kind = self.kind.parse::<EntryKind>().ok().ok_or_raise(|| ErrorKind::InvalidData("entry kind"))?;
        let size = u64::try_from(self.size).or_raise(|| ErrorKind::InvalidData("entry size"))?;
        Ok(DirectoryEntry::new(parent.join(&self.name), kind, size, from_nanos(self.mtime)?))
    }
}
impl TryFrom<&DirectoryEntry> for EntryRow {
    type Error = Error;
    fn try_from(entry: &DirectoryEntry) -> std::result::Result<Self, Self::Error> {
        if entry.name.is_empty() {
            exn::bail!(ErrorKind::InvalidData("entry name"));
        }
        Ok(Self {
            name: entry.name.clone(),
            kind: entry.kind.as_str().to_string(),
            size: i64::try_from(entry.size).or_raise(|| ErrorKind::InvalidData("entry size"))?,
            mtime: to_nanos(entry.modified)?,
        })
    }
}
