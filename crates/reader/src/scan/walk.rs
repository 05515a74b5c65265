use super::{ScanEvent, ScanOptions, ScanSummary, checkpoint};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use folio_cache::CacheIndex;
use folio_storage::error::ErrorKind as StorageErrorKind;
use folio_storage::{BackendHandle, DirectoryEntry};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::time::Instant;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Collects entries into fixed-size batches.
struct Batcher {
    size: usize,
    pending: Vec<DirectoryEntry>,
    /// Entries actually handed to the consumer.
    delivered: u64,
}
impl Batcher {
    fn new(size: usize) -> Self {
        Self { size, pending: Vec::with_capacity(size), delivered: 0 }
    }

    fn push(&mut self, entry: DirectoryEntry) -> Option<Vec<DirectoryEntry>> {
        self.pending.push(entry);
        (self.pending.len() >= self.size).then(|| self.take())
    }

    fn flush(&mut self) -> Option<Vec<DirectoryEntry>> {
        (!self.pending.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> Vec<DirectoryEntry> {
        std::mem::replace(&mut self.pending, Vec::with_capacity(self.size))
    }
}

/// Mirrors the unfiltered listing into the snapshot index, one batch at a
/// time. Index failures are logged and turn the writer off; they never fail
/// the scan.
struct SnapshotWriter {
    index: CacheIndex,
    path: PathBuf,
    pending: Vec<DirectoryEntry>,
    size: usize,
    healthy: bool,
}
impl SnapshotWriter {
    async fn begin(index: CacheIndex, path: &Path, mtime: OffsetDateTime, size: usize) -> Option<Self> {
        match index.begin(path, mtime).await {
            Ok(()) => Some(Self { index, path: path.to_path_buf(), pending: Vec::with_capacity(size), size, healthy: true }),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not start snapshot");
                None
            },
        }
    }

    async fn push(&mut self, entry: &DirectoryEntry) {
        if !self.healthy {
            return;
        }
        self.pending.push(entry.clone());
        if self.pending.len() >= self.size {
            self.write_pending().await;
        }
    }

    async fn write_pending(&mut self) {
        let batch = std::mem::take(&mut self.pending);
        if let Err(err) = self.index.append(&self.path, &batch).await {
            tracing::warn!(path = %self.path.display(), error = %err, "could not append to snapshot");
            self.healthy = false;
        }
    }

    async fn finish(mut self) {
        if self.healthy {
            self.write_pending().await;
        }
        let completed = match self.healthy {
            true => self.index.complete(&self.path).await,
            false => self.index.discard(&self.path).await,
        };
        if let Err(err) = completed {
            tracing::warn!(path = %self.path.display(), error = %err, "could not finish snapshot");
        }
    }

    async fn abandon(self) {
        if let Err(err) = self.index.discard(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %err, "could not discard snapshot");
        }
    }
}

fn error_path(kind: &StorageErrorKind) -> Option<&Path> {
    match kind {
        StorageErrorKind::NotFound(path)
        | StorageErrorKind::PermissionDenied(path)
        | StorageErrorKind::NotADirectory(path)
        | StorageErrorKind::InvalidPath(path) => Some(path),
        _ => None,
    }
}

pub(super) fn walk(
    backend: BackendHandle,
    index: Option<CacheIndex>,
    root: DirectoryEntry,
    path: PathBuf,
    options: ScanOptions,
    token: CancellationToken,
    started: Instant,
) -> impl Stream<Item = Result<ScanEvent>> + Send {
    async_stream::stream! {
        let size = options.batch_size();
        let mut writer = match index {
            Some(index) => SnapshotWriter::begin(index, &path, root.modified, size).await,
            None => None,
        };
        let mut batcher = Batcher::new(size);
        let mut skipped = 0u64;
        // Entries looked at, delivered or not.
        let mut visited = 0usize;
        let mut directories = vec![path.clone()];

        while let Some(dir) = directories.pop() {
            if token.is_cancelled() {
                break;
            }
            let mut subdirectories = Vec::new();
            let mut listing = backend.read_dir_stream(&dir);
            let mut first = true;
            while let Some(item) = listing.next().await {
                let is_first = std::mem::replace(&mut first, false);
                visited += 1;
                // A filter that matches nothing never fills a batch.
                if visited % size == 0 && !checkpoint(&token).await {
                    break;
                }
                let entry = match item {
                    Ok(entry) => entry,
                    Err(err) => {
                        let failed = error_path(&err).map_or_else(|| dir.clone(), Path::to_path_buf);
                        if dir == path && is_first && failed == dir {
                            // The listing of the root itself couldn't be opened.
                            if let Some(writer) = writer.take() {
                                writer.abandon().await;
                            }
                            tracing::warn!(path = %path.display(), error = %err, "scan root unavailable");
                            yield Err(err).or_raise(|| ErrorKind::RootUnavailable(path.clone()));
                            return;
                        }
                        skipped += 1;
                        tracing::warn!(path = %failed.display(), error = %err, skipped, "skipping unreadable entry");
                        if let Some(writer) = writer.as_mut() {
                            // The stored listing would be missing this entry.
                            writer.healthy = false;
                        }
                        yield Ok(ScanEvent::Skipped { path: failed, skipped_count: skipped });
                        continue;
                    },
                };
                if let Some(writer) = writer.as_mut() {
                    writer.push(&entry).await;
                }
                if options.recursive && entry.is_dir() && !(options.skip_hidden && entry.is_hidden()) {
                    subdirectories.push(entry.path.clone());
                }
                if !options.accepts(&entry) {
                    continue;
                }
                if let Some(batch) = batcher.push(entry) {
                    if !checkpoint(&token).await {
                        break;
                    }
                    batcher.delivered += batch.len() as u64;
                    yield Ok(ScanEvent::Batch(batch));
                }
            }
            directories.extend(subdirectories.into_iter().rev());
        }

        if !token.is_cancelled() {
            if let Some(batch) = batcher.flush() {
                if checkpoint(&token).await {
                    batcher.delivered += batch.len() as u64;
                    yield Ok(ScanEvent::Batch(batch));
                }
            }
        }
        if token.is_cancelled() {
            if let Some(writer) = writer.take() {
                writer.abandon().await;
            }
            tracing::debug!(path = %path.display(), delivered = batcher.delivered, "scan cancelled");
            yield Ok(ScanEvent::Cancelled { delivered: batcher.delivered });
            return;
        }

        if let Some(writer) = writer.take() {
            writer.finish().await;
        }
        let summary = ScanSummary { total: batcher.delivered, skipped, elapsed: started.elapsed(), from_cache: false };
        tracing::debug!(path = %path.display(), total = summary.total, skipped, "scan completed");
        yield Ok(ScanEvent::Completed(summary));
    }
}
