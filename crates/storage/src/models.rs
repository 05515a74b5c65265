//! Storage models.
//!
//! These types represent directory listing results, both as produced live by
//! storage backends and as replayed from the snapshot cache.

use folio_archive::ArchiveFormat;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}
impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }
}
impl std::str::FromStr for EntryKind {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(EntryKind::File),
            "directory" => Ok(EntryKind::Directory),
            _ => Err(()),
        }
    }
}

/// One entry of a directory listing.
///
/// Immutable once emitted by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Relative path from storage root
    pub path: PathBuf,
    /// Display name (final path component)
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (zero for directories)
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
    /// Container format detected from the file name, if this is an archive
    pub archive: Option<ArchiveFormat>,
}
impl DirectoryEntry {
    pub fn new(path: impl Into<PathBuf>, kind: EntryKind, size: u64, modified: OffsetDateTime) -> Self {
        let path = path.into();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let archive = match kind {
            EntryKind::File => ArchiveFormat::from_path(&path),
            EntryKind::Directory => None,
        };
        let size = match kind {
            EntryKind::File => size,
            EntryKind::Directory => 0,
        };
        Self { path, name, kind, size, modified, archive }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Dotfiles, by the usual Unix convention.
    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }

    /// Whether this entry can be opened as a book: a folder, a supported
    /// archive, or a single page.
    pub fn is_readable(&self) -> bool {
        self.is_dir() || self.archive.is_some_and(|a| a.is_supported()) || folio_archive::is_page(&self.name)
    }

    pub fn parent(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }
}
