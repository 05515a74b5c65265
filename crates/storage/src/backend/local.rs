//! Local filesystem storage backend.
//!
//! Everything is relative to a configured root directory and accessed via
//! `tokio::fs` for async I/O.

use crate::backend::{BoxSyncRead, BoxSyncReadSeek, EntryStream};
use crate::error::ErrorKind;
use crate::{DirectoryEntry, EntryKind, StorageBackend, error::Result, path};
use async_stream::stream;
use async_trait::async_trait;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncReadExt;

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use folio_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("library", "/path/to/comics")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory being browsed
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or does not name an
    /// existing directory. Nothing is ever created: this backend only reads.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        // Use non-async here; it'll only happen once on startup and it's not
        // worth the hassle of making the constructor async.
        let metadata = std::fs::metadata(&root).map_err(|e| Self::map_io_error(e, &root))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::NotADirectory(root));
        }
        Ok(Self { name: name.into(), root })
    }

    /// Resolve a relative file path against the root.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = path::validate(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Resolve a relative directory path (the root included) against the root.
    /// Returns both the normalized relative path and the absolute one.
    fn directory_path(&self, path: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
        let relative = path::normalize(path.as_ref())?;
        let absolute = self.root.join(&relative);
        Ok((relative, absolute))
    }

    fn entry(relative: PathBuf, metadata: &Metadata) -> Result<DirectoryEntry> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        let kind = match metadata.is_dir() {
            true => EntryKind::Directory,
            false => EntryKind::File,
        };
        Ok(DirectoryEntry::new(relative, kind, metadata.len(), modified))
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::NotADirectory => ErrorKind::NotADirectory(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Stat a single child. Kept out of the stream body so errors can use `?`.
    async fn process_entry(&self, entry: DirEntry, parent: &Path) -> Result<Option<DirectoryEntry>> {
        let relative = parent.join(entry.file_name());
        // Follow symlinks: a linked folder of pages is still a folder of pages.
        let metadata = match fs::metadata(entry.path()).await {
            Ok(metadata) => metadata,
            // Note: silently drop what is most likely a broken symlink.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => exn::bail!(Self::map_io_error(e, &relative)),
        };
        if !metadata.is_dir() && !metadata.is_file() {
            // Sockets, FIFOs, devices.
            return Ok(None);
        }
        Ok(Some(Self::entry(relative, &metadata)?))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_dir_stream<'a>(&'a self, dir: &'a Path) -> EntryStream<'a> {
        let (relative, absolute) = match self.directory_path(dir) {
            Ok(paths) => paths,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };

        Box::pin(stream! {
            let mut entries = match fs::read_dir(&absolute).await {
                Ok(entries) => entries,
                Err(err) => {
                    yield Err(exn::Exn::from(Self::map_io_error(err, &relative)));
                    return;
                }
            };
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(exn::Exn::from(Self::map_io_error(e, &relative)));
                        continue;
                    },
                };
                match self.process_entry(entry, &relative).await {
                    Ok(Some(entry)) => yield Ok(entry),
                    Ok(None) => {},
                    Err(e) => yield Err(e),
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let (_, abs_path) = self.directory_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn stat(&self, path: &Path) -> Result<DirectoryEntry> {
        let (relative, abs_path) = self.directory_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, &relative))?;
        Self::entry(relative, &metadata)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn read_head(&self, path: &Path, bytes: usize) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        let mut buffer = Vec::with_capacity(bytes);
        file.take(bytes as u64).read_to_end(&mut buffer).await.map_err(ErrorKind::Io)?;
        Ok(buffer)
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn seekable_reader(&self, path: &Path) -> Result<BoxSyncReadSeek> {
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        let metadata = file.metadata().await.map_err(ErrorKind::Io)?;
        if metadata.is_dir() {
            exn::bail!(ErrorKind::BackendError(format!("cannot open directory `{}` as a file", path.display())));
        }
        Ok(Box::new(file.into_std().await))
    }
}
