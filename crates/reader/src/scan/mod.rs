//! Batched, cancellable directory scanning.
//!
//! A scan is a lazy stream of [`ScanEvent`]s. Entries arrive in batches of
//! [`MIN_BATCH_SIZE`]..=[`MAX_BATCH_SIZE`] (the last one may be shorter) and
//! cancellation is checked between batches. Unreadable entries are skipped
//! and counted; a root that can't be opened fails the scan before anything
//! is emitted.
//!
//! Non-recursive scans go through the snapshot index when one is
//! configured: an unchanged directory is replayed from its stored listing
//! instead of being walked again.

mod cached;
mod walk;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use folio_cache::{CacheIndex, Lookup};
use folio_config::ScannerConfig;
use folio_storage::{BackendHandle, DirectoryEntry};
use futures::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const MIN_BATCH_SIZE: usize = 15;
pub const MAX_BATCH_SIZE: usize = 50;

pub type ScanStream = Pin<Box<dyn Stream<Item = Result<ScanEvent>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Requested batch size; clamped into `15..=50`.
    pub batch_size: usize,
    /// Leave out entries whose name starts with a dot (and don't descend
    /// into hidden directories).
    pub skip_hidden: bool,
    /// Walk subdirectories depth-first after their parent's listing.
    pub recursive: bool,
    /// Only deliver entries whose name contains this (lowercase) text.
    pub filter: Option<String>,
}
impl Default for ScanOptions {
    fn default() -> Self {
        Self { batch_size: MIN_BATCH_SIZE, skip_hidden: true, recursive: false, filter: None }
    }
}
impl From<&ScannerConfig> for ScanOptions {
    fn from(config: &ScannerConfig) -> Self {
        Self { batch_size: config.batch_size, skip_hidden: config.skip_hidden, recursive: config.recursive, filter: None }
    }
}
impl ScanOptions {
    /// Recursive name search below a directory.
    pub fn search(query: impl AsRef<str>) -> Self {
        Self { recursive: true, filter: Some(query.as_ref().to_lowercase()), ..Self::default() }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
    }

    fn accepts(&self, entry: &DirectoryEntry) -> bool {
        if self.skip_hidden && entry.is_hidden() {
            return false;
        }
        match &self.filter {
            Some(query) => entry.name.to_lowercase().contains(query.as_str()),
            None => true,
        }
    }

    /// Only plain listings are worth persisting; a filtered or recursive
    /// result isn't the listing of one directory.
    fn uses_index(&self) -> bool {
        !self.recursive && self.filter.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Batch(Vec<DirectoryEntry>),
    /// An entry couldn't be read and was left out.
    Skipped { path: PathBuf, skipped_count: u64 },
    Completed(ScanSummary),
    /// The scan stopped at a checkpoint because its token was cancelled.
    Cancelled { delivered: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    /// Entries delivered across all batches.
    pub total: u64,
    pub skipped: u64,
    pub elapsed: Duration,
    pub from_cache: bool,
}

/// Yield to the scheduler and report whether the scan may continue.
async fn checkpoint(token: &CancellationToken) -> bool {
    tokio::task::yield_now().await;
    !token.is_cancelled()
}

async fn open_root(backend: &BackendHandle, path: &Path) -> Result<DirectoryEntry> {
    let root = backend.stat(path).await.or_raise(|| ErrorKind::RootUnavailable(path.to_path_buf()))?;
    if !root.is_dir() {
        exn::bail!(ErrorKind::RootUnavailable(path.to_path_buf()));
    }
    Ok(root)
}

#[derive(Clone)]
pub struct DirectoryScanner {
    backend: BackendHandle,
    index: Option<CacheIndex>,
}
impl DirectoryScanner {
    pub fn new(backend: BackendHandle, index: Option<CacheIndex>) -> Self {
        Self { backend, index }
    }

    /// Stream the contents of `path`.
    ///
    /// The stream is finite and can't be restarted. It ends with exactly one
    /// of [`ScanEvent::Completed`], [`ScanEvent::Cancelled`] or an error.
    pub fn scan_streaming(&self, path: impl Into<PathBuf>, options: ScanOptions, token: CancellationToken) -> ScanStream {
        let backend = Arc::clone(&self.backend);
        let index = self.index.clone().filter(|_| options.uses_index());
        let path = path.into();
        Box::pin(async_stream::stream! {
            let started = Instant::now();
            let root = match open_root(&backend, &path).await {
                Ok(root) => root,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "scan root unavailable");
                    yield Err(err);
                    return;
                },
            };

            let mut index = index;
            if let Some(snapshots) = &index {
                match snapshots.lookup(&path, root.modified).await {
                    Ok(Lookup::Hit(snapshot)) => {
                        tracing::debug!(path = %path.display(), entries = snapshot.entries.len(), "replaying snapshot");
                        for await event in cached::replay(snapshot, options, token, started) {
                            yield event;
                        }
                        return;
                    },
                    Ok(Lookup::Corrupted) => {
                        let err = ErrorKind::SnapshotCorrupted(path.clone());
                        tracing::warn!(error = %err, "rescanning");
                    },
                    Ok(Lookup::Miss | Lookup::Stale) => {},
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "snapshot index unavailable, scanning without it");
                        index = None;
                    },
                }
            }

            for await event in walk::walk(backend, index, root, path, options, token, started) {
                yield event;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_cache::{Database, IndexOptions};
    use folio_storage::backend::MockBackend;
    use futures::StreamExt;
    use rstest::rstest;

    pub(crate) fn pages(dir: &str, count: usize) -> Vec<(String, Vec<u8>)> {
        (0..count).map(|i| (format!("{dir}/{i:03}.png"), vec![0u8; 8])).collect()
    }

    fn scanner(backend: MockBackend, index: Option<CacheIndex>) -> DirectoryScanner {
        DirectoryScanner::new(Arc::new(backend), index)
    }

    async fn index() -> CacheIndex {
        CacheIndex::new(&Database::connect_in_memory().await.unwrap(), IndexOptions::default())
    }

    async fn collect(stream: ScanStream) -> Vec<Result<ScanEvent>> {
        stream.collect().await
    }

    fn batches(events: &[Result<ScanEvent>]) -> Vec<Vec<DirectoryEntry>> {
        events
            .iter()
            .filter_map(|e| match e {
                Ok(ScanEvent::Batch(batch)) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    fn summary(events: &[Result<ScanEvent>]) -> ScanSummary {
        match events.last() {
            Some(Ok(ScanEvent::Completed(summary))) => *summary,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[rstest]
    #[case(0, MIN_BATCH_SIZE)]
    #[case(15, 15)]
    #[case(32, 32)]
    #[case(50, 50)]
    #[case(500, MAX_BATCH_SIZE)]
    fn test_batch_size_is_clamped(#[case] requested: usize, #[case] expected: usize) {
        let options = ScanOptions { batch_size: requested, ..Default::default() };
        assert_eq!(options.batch_size(), expected);
    }

    #[tokio::test]
    async fn test_denied_entry_is_skipped_and_counted() {
        let mut files = pages("series", 10);
        files.push(("series/secret.png".to_string(), vec![1]));
        let backend = MockBackend::with_files(files).with_denied("series/secret.png");
        let events = collect(scanner(backend, None).scan_streaming("series", ScanOptions::default(), CancellationToken::new())).await;

        let delivered: Vec<_> = batches(&events).into_iter().flatten().collect();
        assert_eq!(delivered.len(), 10);
        assert!(delivered.iter().all(|e| e.name != "secret.png"));
        let skipped: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Ok(ScanEvent::Skipped { path, skipped_count }) => Some((path.clone(), *skipped_count)),
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec![(PathBuf::from("series/secret.png"), 1)]);
        let summary = summary(&events);
        assert_eq!((summary.total, summary.skipped, summary.from_cache), (10, 1, false));
    }

    #[tokio::test]
    async fn test_batches_are_exhaustive_and_bounded() {
        let backend = MockBackend::with_files(pages("big", 112));
        let options = ScanOptions { batch_size: 25, ..Default::default() };
        let events = collect(scanner(backend, None).scan_streaming("big", options, CancellationToken::new())).await;

        let batches = batches(&events);
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![25, 25, 25, 25, 12]);
        let mut names: Vec<_> = batches.into_iter().flatten().map(|e| e.name).collect();
        let count = names.len();
        names.dedup();
        assert_eq!(names.len(), count, "batches overlap");
        assert_eq!(summary(&events).total, 112);
    }

    #[tokio::test]
    async fn test_unavailable_root_fails_without_output() {
        let backend = MockBackend::with_files(pages("locked", 3)).with_denied("locked");
        let events = collect(scanner(backend, None).scan_streaming("locked", ScanOptions::default(), CancellationToken::new())).await;
        assert_eq!(events.len(), 1);
        let err = events.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::RootUnavailable(p) if p == Path::new("locked")));
    }

    #[rstest]
    #[case::missing("nowhere")]
    #[case::file("series/000.png")]
    #[tokio::test]
    async fn test_root_must_be_a_directory(#[case] root: &str) {
        let backend = MockBackend::with_files(pages("series", 1));
        let events = collect(scanner(backend, None).scan_streaming(root, ScanOptions::default(), CancellationToken::new())).await;
        assert!(matches!(events.as_slice(), [Err(err)] if matches!(&**err, ErrorKind::RootUnavailable(_))));
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_checkpoint() {
        let backend = MockBackend::with_files(pages("big", 200));
        let token = CancellationToken::new();
        let mut stream = scanner(backend, None).scan_streaming("big", ScanOptions::default(), token.clone());

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, ScanEvent::Batch(ref b) if b.len() == MIN_BATCH_SIZE));
        token.cancel();
        let rest: Vec<_> = stream.collect().await;
        assert!(matches!(rest.as_slice(), [Ok(ScanEvent::Cancelled { delivered: 15 })]));
    }

    #[tokio::test]
    async fn test_search_without_matches_still_sees_cancellation() {
        let backend = MockBackend::with_files(pages("huge", 20_000));
        let token = CancellationToken::new();
        let stream = scanner(backend, None).scan_streaming("huge", ScanOptions::search("no such page"), token.clone());
        let walking = tokio::spawn(collect(stream));
        // Let the walk get going before pulling the plug.
        tokio::task::yield_now().await;
        token.cancel();
        let events = tokio::time::timeout(Duration::from_secs(5), walking).await.unwrap().unwrap();
        assert!(matches!(events.as_slice(), [Ok(ScanEvent::Cancelled { delivered: 0 })]), "{events:?}");
    }

    #[tokio::test]
    async fn test_hidden_entries_are_filtered() {
        let backend = MockBackend::with_files([("d/.DS_Store", vec![0]), ("d/001.png", vec![0]), ("d/.cache/x", vec![0])]);
        let events = collect(scanner(backend, None).scan_streaming("d", ScanOptions::default(), CancellationToken::new())).await;
        let names: Vec<_> = batches(&events).into_iter().flatten().map(|e| e.name).collect();
        assert_eq!(names, vec!["001.png"]);

        let backend = MockBackend::with_files([("d/.DS_Store", vec![0]), ("d/001.png", vec![0])]);
        let options = ScanOptions { skip_hidden: false, ..Default::default() };
        let events = collect(scanner(backend, None).scan_streaming("d", options, CancellationToken::new())).await;
        assert_eq!(summary(&events).total, 2);
    }

    #[tokio::test]
    async fn test_recursive_walk_is_depth_first() {
        let backend = MockBackend::with_files([
            ("root/a/1.png", vec![0]),
            ("root/a/deep/2.png", vec![0]),
            ("root/b/3.png", vec![0]),
            ("root/top.png", vec![0]),
        ]);
        let options = ScanOptions { recursive: true, ..Default::default() };
        let events = collect(scanner(backend, None).scan_streaming("root", options, CancellationToken::new())).await;
        let paths: Vec<_> = batches(&events).into_iter().flatten().map(|e| e.path).collect();
        let expected = ["root/a", "root/b", "root/top.png", "root/a/1.png", "root/a/deep", "root/a/deep/2.png", "root/b/3.png"];
        assert_eq!(paths, expected.map(PathBuf::from));
    }

    #[tokio::test]
    async fn test_search_matches_names_recursively() {
        let backend = MockBackend::with_files([
            ("lib/Cover.png", vec![0]),
            ("lib/vol1/cover.jpg", vec![0]),
            ("lib/vol1/001.png", vec![0]),
        ]);
        let events = collect(scanner(backend, None).scan_streaming("lib", ScanOptions::search("COVER"), CancellationToken::new())).await;
        let names: Vec<_> = batches(&events).into_iter().flatten().map(|e| e.name).collect();
        assert_eq!(names, vec!["Cover.png", "cover.jpg"]);
    }

    #[tokio::test]
    async fn test_unchanged_directory_is_served_from_index() {
        let backend = Arc::new(MockBackend::with_files(pages("series", 20)));
        let index = index().await;
        let scanner = DirectoryScanner::new(backend.clone(), Some(index.clone()));

        let first = collect(scanner.scan_streaming("series", ScanOptions::default(), CancellationToken::new())).await;
        assert!(!summary(&first).from_cache);
        let second = collect(scanner.scan_streaming("series", ScanOptions::default(), CancellationToken::new())).await;
        assert!(summary(&second).from_cache);
        assert_eq!(batches(&first), batches(&second));

        // Any change to the listing bumps the mtime and forces a walk.
        backend.write("series/new.png", vec![0]).await.unwrap();
        let third = collect(scanner.scan_streaming("series", ScanOptions::default(), CancellationToken::new())).await;
        assert!(!summary(&third).from_cache);
        assert_eq!(summary(&third).total, 21);
    }

    #[tokio::test]
    async fn test_cancelled_walk_leaves_no_snapshot() {
        let backend = Arc::new(MockBackend::with_files(pages("big", 100)));
        let index = index().await;
        let scanner = DirectoryScanner::new(backend, Some(index.clone()));
        let token = CancellationToken::new();
        let mut stream = scanner.scan_streaming("big", ScanOptions::default(), token.clone());
        stream.next().await.unwrap().unwrap();
        token.cancel();
        while stream.next().await.is_some() {}
        assert_eq!(index.stats().await.unwrap().snapshots, 0);
    }

    #[tokio::test]
    async fn test_listing_with_skipped_entries_is_not_persisted() {
        let backend = Arc::new(MockBackend::with_files(pages("d", 3)).with_denied("d/001.png"));
        let index = index().await;
        let scanner = DirectoryScanner::new(backend, Some(index.clone()));
        let events = collect(scanner.scan_streaming("d", ScanOptions::default(), CancellationToken::new())).await;
        assert_eq!(summary(&events).skipped, 1);
        assert_eq!(index.stats().await.unwrap().complete, 0);
    }

    #[tokio::test]
    async fn test_snapshot_keeps_hidden_entries() {
        let backend = Arc::new(MockBackend::with_files([("d/.hidden.png", vec![0]), ("d/001.png", vec![0])]));
        let index = index().await;
        let scanner = DirectoryScanner::new(backend, Some(index.clone()));
        collect(scanner.scan_streaming("d", ScanOptions::default(), CancellationToken::new())).await;

        let options = ScanOptions { skip_hidden: false, ..Default::default() };
        let events = collect(scanner.scan_streaming("d", options, CancellationToken::new())).await;
        assert!(summary(&events).from_cache);
        assert_eq!(summary(&events).total, 2);
    }
}
