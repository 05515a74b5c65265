//! In-memory storage backend for testing.

use super::{BoxSyncRead, BoxSyncReadSeek, EntryStream};
use crate::error::{ErrorKind, Result};
use crate::path::{normalize, validate as validate_path};
use crate::{DirectoryEntry, EntryKind, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    files: BTreeMap<PathBuf, (OffsetDateTime, Vec<u8>)>,
    /// Every directory that exists (ancestors of files, plus the root), with
    /// its modification time.
    dirs: BTreeMap<PathBuf, OffsetDateTime>,
    /// Paths whose metadata can't be read.
    denied: HashSet<PathBuf>,
    clock: Option<OffsetDateTime>,
}
impl State {
    /// Strictly increasing timestamps, so that two quick writes never leave a
    /// directory with the same mtime.
    fn tick(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let next = match self.clock {
            Some(last) if now <= last => last + Duration::from_millis(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }

    fn insert_file(&mut self, path: PathBuf, data: Vec<u8>) {
        let now = self.tick();
        let mut parent = path.parent();
        while let Some(dir) = parent {
            // Only the immediate parent's listing changed, but the ancestors
            // need to exist.
            let is_immediate = Some(dir) == path.parent();
            match self.dirs.get_mut(dir) {
                Some(mtime) if is_immediate => *mtime = now,
                Some(_) => {},
                None => {
                    self.dirs.insert(dir.to_path_buf(), now);
                },
            }
            parent = dir.parent();
        }
        self.files.insert(path, (now, data));
    }

    fn is_denied(&self, path: &Path) -> bool {
        self.denied.contains(path)
    }

    fn children(&self, dir: &Path) -> Vec<Result<DirectoryEntry>> {
        let dirs = self
            .dirs
            .iter()
            .filter(|(path, _)| !path.as_os_str().is_empty() && path.parent() == Some(dir))
            .map(|(path, mtime)| (path, EntryKind::Directory, 0, *mtime));
        let files = self
            .files
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .map(|(path, (mtime, data))| (path, EntryKind::File, data.len() as u64, *mtime));
        let mut children: Vec<_> = dirs.chain(files).collect();
        children.sort_by(|a, b| a.0.cmp(b.0));
        children
            .into_iter()
            .map(|(path, kind, size, mtime)| match self.is_denied(path) {
                true => Err(exn::Exn::from(ErrorKind::PermissionDenied(path.clone()))),
                false => Ok(DirectoryEntry::new(path.clone(), kind, size, mtime)),
            })
            .collect()
    }

    fn file(&self, path: &Path) -> Result<&Vec<u8>> {
        if self.is_denied(path) {
            exn::bail!(ErrorKind::PermissionDenied(path.to_path_buf()));
        }
        match self.files.get(path) {
            Some((_, data)) => Ok(data),
            None => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
        }
    }
}

/// In-memory storage backend for testing.
///
/// Files live in a map behind a [`RwLock`], so all trait methods can operate
/// on `&self` without external synchronisation. Directories are implied by
/// file paths. Paths can be marked as denied to simulate permission errors.
///
/// # Examples
///
/// ```
/// use folio_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("series/001.png", b"page one"),
/// ]);
/// assert!(backend.exists(Path::new("series/001.png")).await?);
/// assert!(backend.stat(Path::new("series")).await?.is_dir());
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    state: RwLock<State>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut state = State::default();
        let now = state.tick();
        state.dirs.insert(PathBuf::new(), now);
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            state.insert_file(validated, data.into());
        }
        Self { name: "mock".to_string(), state: RwLock::new(state) }
    }

    /// Make reading the metadata or contents of `path` fail with
    /// [`PermissionDenied`](ErrorKind::PermissionDenied).
    pub fn with_denied(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let Ok(normalized) = normalize(&path) else {
            panic!("MockBackend::with_denied: invalid path {}", path.display());
        };
        self.state.get_mut().denied.insert(normalized);
        self
    }

    /// Add or replace a file, bumping its parent directory's mtime.
    pub async fn write(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) -> Result<()> {
        let path = validate_path(path.as_ref())?;
        self.state.write().await.insert_file(path, data.into());
        Ok(())
    }

    /// Remove a file, bumping its parent directory's mtime.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = validate_path(path.as_ref())?;
        let mut state = self.state.write().await;
        if state.files.remove(&path).is_none() {
            exn::bail!(ErrorKind::NotFound(path));
        }
        let now = state.tick();
        if let Some(mtime) = path.parent().and_then(|parent| state.dirs.get_mut(parent)) {
            *mtime = now;
        }
        Ok(())
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &[u8]); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_dir_stream<'a>(&'a self, dir: &'a Path) -> EntryStream<'a> {
        let dir = match normalize(dir) {
            Ok(dir) => dir,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot the listing under the read lock, then drop it before
            // yielding to avoid holding the lock across yield points.
            let listing = {
                let state = self.state.read().await;
                if state.is_denied(&dir) {
                    Err(exn::Exn::from(ErrorKind::PermissionDenied(dir.clone())))
                } else if state.files.contains_key(&dir) {
                    Err(exn::Exn::from(ErrorKind::NotADirectory(dir.clone())))
                } else if !state.dirs.contains_key(&dir) {
                    Err(exn::Exn::from(ErrorKind::NotFound(dir.clone())))
                } else {
                    Ok(state.children(&dir))
                }
            };
            match listing {
                Ok(children) => for child in children {
                    yield child;
                },
                Err(e) => yield Err(e),
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = normalize(path)?;
        let state = self.state.read().await;
        Ok(state.files.contains_key(&path) || state.dirs.contains_key(&path))
    }

    async fn stat(&self, path: &Path) -> Result<DirectoryEntry> {
        let path = normalize(path)?;
        let state = self.state.read().await;
        if state.is_denied(&path) {
            exn::bail!(ErrorKind::PermissionDenied(path));
        }
        if let Some(mtime) = state.dirs.get(&path) {
            return Ok(DirectoryEntry::new(path.clone(), EntryKind::Directory, 0, *mtime));
        }
        match state.files.get(&path) {
            Some((mtime, data)) => Ok(DirectoryEntry::new(path.clone(), EntryKind::File, data.len() as u64, *mtime)),
            None => exn::bail!(ErrorKind::NotFound(path)),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        Ok(self.state.read().await.file(&path)?.clone())
    }

    async fn read_head(&self, path: &Path, bytes: usize) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let state = self.state.read().await;
        let data = state.file(&path)?;
        Ok(data[..bytes.min(data.len())].to_vec())
    }

    async fn reader(&self, path: &Path) -> Result<BoxSyncRead> {
        Ok(Box::new(Cursor::new(self.read(path).await?)))
    }

    async fn seekable_reader(&self, path: &Path) -> Result<BoxSyncReadSeek> {
        Ok(Box::new(Cursor::new(self.read(path).await?)))
    }
}
