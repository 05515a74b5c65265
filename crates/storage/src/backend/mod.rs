//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, the read-only view of a
//! filesystem that the reader core browses and pulls pages from.

mod local;
#[cfg(feature = "mock")]
mod mock;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
use crate::DirectoryEntry;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::io::{Read, Seek};
use std::path::Path;
use std::pin::Pin;

pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<DirectoryEntry>> + Send + 'a>>;
pub type BoxSyncRead = Box<dyn Read + Send + 'static>;
pub type BoxSyncReadSeek = Box<dyn ReadSeek + 'static>;

/// A blocking reader that can also seek (random-access archives need both).
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Unified, read-only interface for storage backends.
///
/// # Path Handling
/// All paths are relative to the storage root. File paths are validated with
/// [`validate_path`](crate::validate_path), directory paths with
/// [`normalize_path`](crate::normalize_path) (where the empty path is the
/// root itself). Implementations should enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use folio_storage::{backend::StorageBackend, error::Result};
///
/// async fn cover_size(backend: &dyn StorageBackend) -> Result<u64> {
///     let path = Path::new("series/cover.jpg");
///     if backend.exists(path).await? {
///         Ok(backend.read(path).await?.len() as u64)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// List the immediate children of a directory, collected into a [`Vec`].
    ///
    /// Fails on the first error; use [`read_dir_stream`](Self::read_dir_stream)
    /// to skip unreadable entries instead.
    async fn read_dir(&self, dir: &Path) -> Result<Vec<DirectoryEntry>> {
        self.read_dir_stream(dir).try_collect().await
    }

    /// Stream the immediate children of a directory.
    ///
    /// If the directory itself can't be opened, the stream yields exactly one
    /// error and ends. Errors for individual children (e.g.
    /// [`PermissionDenied`](crate::error::ErrorKind::PermissionDenied) while
    /// reading their metadata) are yielded in place and the listing carries
    /// on, so callers can count and skip them.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use futures::StreamExt;
    /// use std::path::Path;
    /// # use folio_storage::backend::StorageBackend;
    /// # async fn example(backend: &dyn StorageBackend) {
    /// let mut skipped = 0;
    /// let mut listing = backend.read_dir_stream(Path::new("comics"));
    /// while let Some(entry) = listing.next().await {
    ///     match entry {
    ///         Ok(entry) => println!("{}", entry.name),
    ///         Err(_) => skipped += 1,
    ///     }
    /// }
    /// # }
    /// ```
    fn read_dir_stream<'a>(&'a self, dir: &'a Path) -> EntryStream<'a>;

    /// Check if a file or directory exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get file or directory metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if nothing
    /// exists at `path`. The empty path is the root directory.
    async fn stat(&self, path: &Path) -> Result<DirectoryEntry>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Read only the first N bytes (for magic byte detection).
    ///
    /// If the file is smaller than `bytes`, returns the entire file.
    async fn read_head(&self, path: &Path, bytes: usize) -> Result<Vec<u8>>;

    /// Open a file for streaming reads.
    ///
    /// Returns a `'static` boxed [`Read`] suitable for use inside
    /// [`spawn_blocking`](tokio::task::spawn_blocking). The async setup
    /// (opening the file) happens before returning.
    async fn reader(&self, path: &Path) -> Result<BoxSyncRead>;

    /// Open a file for random-access reads (zip central directories live at
    /// the end of the file).
    async fn seekable_reader(&self, path: &Path) -> Result<BoxSyncReadSeek>;
}
