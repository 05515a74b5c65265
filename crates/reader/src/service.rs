//! The reader facade: one owned instance wiring scanning, sessions, the page
//! cache, prefetching and archive extraction together.

use crate::container::{Container, OpenContainer, OpenOptions};
use crate::error::{ErrorKind, Result};
use crate::events::{EventBus, ReaderEvent};
use crate::page_cache::{CacheStats, Direction, PageCache, PageKey};
use crate::prefetch::{ForegroundGate, PageFetcher, PrefetchOptions, PrefetchStats, Prefetcher};
use crate::scan::{DirectoryScanner, ScanEvent, ScanOptions};
use crate::session::{Opened, SessionId, SessionKind, StreamManager, StreamSession};
use crate::solid::SolidOptions;
use async_trait::async_trait;
use bytes::Bytes;
use exn::ResultExt;
use folio_cache::{CacheIndex, Database, IndexOptions, IndexStats};
use folio_config::Config;
use folio_storage::BackendHandle;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Outcome of [`Reader::try_get_page`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Ready(Bytes),
    /// The page is being loaded; [`ReaderEvent::PageReady`] or
    /// [`ReaderEvent::PageFailed`] follows.
    Pending,
}

/// The page currently on screen, kept locked in the cache.
struct Displayed {
    key: PageKey,
    index: usize,
}

struct Inner {
    backend: BackendHandle,
    config: Config,
    scanner: DirectoryScanner,
    index: Option<CacheIndex>,
    sessions: StreamManager,
    cache: PageCache,
    events: EventBus,
    permits: Arc<Semaphore>,
    gate: Arc<ForegroundGate>,
    prefetcher: Prefetcher,
    containers: RwLock<HashMap<PathBuf, Arc<OpenContainer>>>,
    displayed: Mutex<Option<Displayed>>,
    background_paused: AtomicBool,
    /// Cancelled on shutdown.
    lifetime: CancellationToken,
}
impl Inner {
    fn container(&self, path: &Path) -> Result<Arc<OpenContainer>> {
        match self.containers.read().get(path) {
            Some(open) => Ok(Arc::clone(open)),
            None => exn::bail!(ErrorKind::ContainerNotOpen(path.to_path_buf())),
        }
    }

    fn page_key(open: &OpenContainer, page: usize) -> Result<PageKey> {
        Ok(PageKey::new(open.path(), open.container().page_name(page)?))
    }

    /// Load a page into the cache if it isn't there yet.
    async fn load(&self, open: &OpenContainer, page: usize) -> Result<Bytes> {
        let key = Self::page_key(open, page)?;
        if let Some(bytes) = self.cache.get(&key) {
            return Ok(bytes);
        }
        let bytes = open.read_page(page, Some(self.config.solid.timeout())).await?;
        if let Err(err) = self.cache.insert(key, bytes.clone(), Some(page)) {
            // Still served, just not kept.
            tracing::debug!(container = %open.path().display(), page, error = %err, "page not cached");
        }
        Ok(bytes)
    }

    /// Move the displayed-page lock and re-center eviction and prefetch on
    /// `page`.
    fn show(&self, open: &OpenContainer, page: usize, direction: Option<Direction>) -> Result<()> {
        let key = Self::page_key(open, page)?;
        let mut displayed = self.displayed.lock();
        let direction = direction.unwrap_or_else(|| match displayed.as_ref() {
            Some(previous) if previous.key.container == key.container => Direction::between(previous.index, page),
            _ => Direction::Forward,
        });
        if let Some(previous) = displayed.take() {
            self.cache.unlock(&previous.key);
        }
        self.cache.lock(&key);
        *displayed = Some(Displayed { key, index: page });
        drop(displayed);

        self.cache.set_position(open.path(), page, direction);
        self.cache.evict_by_distance(open.path(), page, direction);
        self.prefetcher.update(open.path(), open.container().page_count(), page, direction);
        Ok(())
    }

    fn forget_displayed(&self, container: &Path) {
        let mut displayed = self.displayed.lock();
        if displayed.as_ref().is_some_and(|displayed| displayed.key.container == container) {
            *displayed = None;
        }
    }

    fn open_options(&self) -> OpenOptions {
        OpenOptions {
            solid: SolidOptions::from(&self.config.solid),
            permits: Arc::clone(&self.permits),
            events: Some(self.events.clone()),
            start_paused: self.background_paused.load(Ordering::Acquire),
            cancel: self.lifetime.child_token(),
        }
    }
}

/// Feeds the prefetcher through the reader without keeping it alive.
struct ReaderFetcher(Weak<Inner>);

#[async_trait]
impl PageFetcher for ReaderFetcher {
    async fn fetch(&self, container: &Path, page: usize, token: CancellationToken) -> Result<()> {
        let Some(inner) = self.0.upgrade() else {
            exn::bail!(ErrorKind::Cancelled);
        };
        let open = inner.container(container)?;
        tokio::select! {
            () = token.cancelled() => exn::bail!(ErrorKind::Cancelled),
            loaded = inner.load(&open, page) => loaded.map(drop),
        }
    }

    fn is_cached(&self, container: &Path, page: usize) -> bool {
        let Some(inner) = self.0.upgrade() else {
            return false;
        };
        let Ok(open) = inner.container(container) else {
            return false;
        };
        Inner::page_key(&open, page).is_ok_and(|key| inner.cache.contains(&key))
    }
}

/// Content-delivery core of the reader.
///
/// Cheap to clone; every clone drives the same sessions, cache and
/// background work.
#[derive(Clone)]
pub struct Reader {
    inner: Arc<Inner>,
}
impl Reader {
    /// Build a reader from configuration, connecting the snapshot index if
    /// it is enabled.
    #[instrument(skip_all)]
    pub async fn new(backend: BackendHandle, config: Config) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let index = match config.index.enabled {
            true => {
                let db = Database::connect(&config.index.database).await.or_raise(|| ErrorKind::Index)?;
                let options = IndexOptions {
                    capacity: config.index.capacity,
                    ttl: config.index.ttl(),
                    frequency_weight: config.index.frequency_weight(),
                };
                Some(CacheIndex::new(&db, options))
            },
            false => None,
        };
        Ok(Self::with_index(backend, config, index))
    }

    /// Build a reader around an already connected (or no) snapshot index.
    pub fn with_index(backend: BackendHandle, config: Config, index: Option<CacheIndex>) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max_concurrency.max(1)));
        let gate = Arc::new(ForegroundGate::default());
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let fetcher: Arc<dyn PageFetcher> = Arc::new(ReaderFetcher(weak.clone()));
            Inner {
                scanner: DirectoryScanner::new(Arc::clone(&backend), index.clone()),
                prefetcher: Prefetcher::new(fetcher, PrefetchOptions::from(&config.prefetch), Arc::clone(&gate)),
                cache: PageCache::new(config.page_cache.max_bytes),
                backend,
                index,
                sessions: StreamManager::new(),
                events: EventBus::default(),
                permits,
                gate,
                containers: RwLock::default(),
                displayed: Mutex::new(None),
                background_paused: AtomicBool::new(false),
                lifetime: CancellationToken::new(),
                config,
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.inner.events.subscribe()
    }

    // =========================================================================
    // Streaming sessions
    // =========================================================================

    /// Start streaming a directory listing (or a name search, when
    /// `options.filter` is set). Results arrive as [`ReaderEvent`]s.
    ///
    /// An identical request that's still running is joined instead of
    /// started twice.
    pub fn open_stream(&self, path: impl Into<PathBuf>, options: ScanOptions) -> SessionId {
        let kind = match &options.filter {
            Some(query) => SessionKind::Search { query: query.clone() },
            None => SessionKind::Scan,
        };
        match self.inner.sessions.open(path, kind) {
            Opened::Existing(session) => session.id,
            Opened::New(session) => {
                let id = session.id;
                tokio::spawn(drive(Arc::clone(&self.inner), session, options));
                id
            },
        }
    }

    /// Returns `false` if the session is unknown or already finished.
    pub fn cancel_stream(&self, id: SessionId) -> bool {
        self.inner.sessions.cancel(id)
    }

    pub fn cancel_streams_for_path(&self, path: impl AsRef<Path>) -> usize {
        self.inner.sessions.cancel_all_for_path(path)
    }

    pub fn active_streams(&self) -> usize {
        self.inner.sessions.active_count()
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Open a directory or archive for reading. Opening it again returns the
    /// existing listing.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn open_container(&self, path: impl AsRef<Path>) -> Result<Container> {
        let path = path.as_ref();
        if let Ok(open) = self.inner.container(path) {
            return Ok(open.container().clone());
        }
        let open = OpenContainer::open(Arc::clone(&self.inner.backend), path, &self.inner.open_options()).await?;
        let container = open.container().clone();
        let mut containers = self.inner.containers.write();
        match containers.get(path) {
            // Someone else won the race; theirs is the one in use.
            Some(existing) => {
                open.close();
                Ok(existing.container().clone())
            },
            None => {
                containers.insert(path.to_path_buf(), Arc::new(open));
                Ok(container)
            },
        }
    }

    /// Stop background work for a container and drop its cached pages.
    pub fn close_container(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let Some(open) = self.inner.containers.write().remove(path) else {
            return false;
        };
        open.close();
        self.inner.forget_displayed(path);
        self.inner.prefetcher.cancel_all();
        let dropped = self.inner.cache.remove_container(path);
        tracing::debug!(path = %path.display(), dropped, "closed container");
        true
    }

    /// Fetch a page, waiting for it if it has to be read or extracted. The
    /// page becomes the displayed one: it stays locked in the cache and
    /// prefetching re-centers on it.
    #[instrument(skip(self, container), fields(container = %container.as_ref().display()))]
    pub async fn get_page(&self, container: impl AsRef<Path>, page: usize) -> Result<Bytes> {
        let open = self.inner.container(container.as_ref())?;
        let bytes = {
            let _foreground = self.inner.gate.enter();
            self.inner.load(&open, page).await?
        };
        self.inner.show(&open, page, None)?;
        Ok(bytes)
    }

    /// Like [`get_page`](Self::get_page), but never waits: a page that isn't
    /// cached is loaded in the background and announced with
    /// [`ReaderEvent::PageReady`] or [`ReaderEvent::PageFailed`].
    pub fn try_get_page(&self, container: impl AsRef<Path>, page: usize) -> Result<PageRequest> {
        let container = container.as_ref();
        let open = self.inner.container(container)?;
        let key = Inner::page_key(&open, page)?;
        if let Some(bytes) = self.inner.cache.get(&key) {
            self.inner.show(&open, page, None)?;
            return Ok(PageRequest::Ready(bytes));
        }
        let reader = self.clone();
        let container = container.to_path_buf();
        tokio::spawn(async move {
            let event = match reader.get_page(&container, page).await {
                Ok(_) => ReaderEvent::PageReady { container, page },
                Err(err) => {
                    tracing::warn!(container = %container.display(), page, error = %err, "page load failed");
                    ReaderEvent::PageFailed { container, page, message: err.to_string() }
                },
            };
            reader.inner.events.publish(event);
        });
        Ok(PageRequest::Pending)
    }

    /// Tell the reader the viewing position moved without fetching. Evicts
    /// by distance from the new position and re-plans prefetching.
    pub fn notify_position_changed(&self, container: impl AsRef<Path>, page: usize, direction: Direction) -> Result<()> {
        let open = self.inner.container(container.as_ref())?;
        self.inner.show(&open, page, Some(direction))
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn prefetch_stats(&self) -> PrefetchStats {
        self.inner.prefetcher.stats()
    }

    pub async fn index_stats(&self) -> Result<Option<IndexStats>> {
        match &self.inner.index {
            Some(index) => Ok(Some(index.stats().await.or_raise(|| ErrorKind::Index)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Background work
    // =========================================================================

    /// Hold prefetching and solid extractions, e.g. while the host is busy.
    /// Foreground page requests still work for pages already extracted.
    pub fn pause_background(&self) {
        self.inner.background_paused.store(true, Ordering::Release);
        self.inner.prefetcher.pause();
        for open in self.inner.containers.read().values() {
            if let Some(extractor) = open.extractor() {
                extractor.pause();
            }
        }
        tracing::debug!("background work paused");
    }

    pub fn resume_background(&self) {
        self.inner.background_paused.store(false, Ordering::Release);
        self.inner.prefetcher.resume();
        for open in self.inner.containers.read().values() {
            if let Some(extractor) = open.extractor() {
                extractor.resume();
            }
        }
        tracing::debug!("background work resumed");
    }

    /// Cancel every session, prefetch and extraction.
    pub fn shutdown(&self) {
        self.inner.lifetime.cancel();
        self.inner.sessions.shutdown();
        self.inner.prefetcher.shutdown();
        let containers: Vec<_> = self.inner.containers.write().drain().collect();
        for (_, open) in containers {
            open.close();
        }
        *self.inner.displayed.lock() = None;
        self.inner.cache.clear();
    }
}

/// Run one session to the end, translating scanner output into events.
async fn drive(inner: Arc<Inner>, session: Arc<StreamSession>, options: ScanOptions) {
    let id = session.id;
    let started = Instant::now();
    let permit = tokio::select! {
        () = session.token.cancelled() => None,
        permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
    };
    if permit.is_none() {
        inner.events.publish(ReaderEvent::Cancelled { session: id });
        inner.sessions.finish(id);
        return;
    }

    let mut stream = inner.scanner.scan_streaming(&session.path, options, session.token.clone());
    let mut batch_index = 0;
    let mut loaded = 0;
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(ScanEvent::Batch(entries)) => {
                loaded += entries.len() as u64;
                let batch = ReaderEvent::Batch { session: id, index: batch_index, entries: entries.into() };
                batch_index += 1;
                inner.events.publish(batch);
                ReaderEvent::Progress { session: id, loaded, elapsed_ms: started.elapsed().as_millis() as u64 }
            },
            Ok(ScanEvent::Skipped { path, skipped_count }) => ReaderEvent::EntrySkipped { session: id, path, skipped_count },
            Ok(ScanEvent::Completed(summary)) => ReaderEvent::Completed {
                session: id,
                total: summary.total,
                skipped: summary.skipped,
                elapsed_ms: summary.elapsed.as_millis() as u64,
                from_cache: summary.from_cache,
            },
            Ok(ScanEvent::Cancelled { .. }) => ReaderEvent::Cancelled { session: id },
            Err(err) => {
                tracing::warn!(session = %id, path = %session.path.display(), error = %err, "session failed");
                ReaderEvent::Failed { session: id, path: session.path.clone(), message: err.to_string() }
            },
        };
        inner.events.publish(event);
    }
    inner.sessions.finish(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_archive::testing::build_tar;
    use folio_storage::backend::MockBackend;
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::default();
        config.index.enabled = false;
        config
    }

    fn reader(backend: MockBackend) -> Reader {
        Reader::with_index(Arc::new(backend), config(), None)
    }

    fn pages(dir: &str, count: usize) -> Vec<(String, Vec<u8>)> {
        (0..count).map(|i| (format!("{dir}/{i:03}.png"), format!("page {i}").into_bytes())).collect()
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<ReaderEvent>,
        wanted: impl Fn(&ReaderEvent) -> bool,
    ) -> ReaderEvent {
        let wait = async {
            loop {
                let event = events.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_stream_skips_unreadable_entry() {
        let mut files = pages("series", 10);
        files.push(("series/secret.png".to_string(), b"no".to_vec()));
        let reader = reader(MockBackend::with_files(files).with_denied("series/secret.png"));
        let mut events = reader.subscribe();
        let id = reader.open_stream("series", ScanOptions::default());

        let mut delivered = 0;
        let mut skipped_events = 0;
        let completed = loop {
            match next_matching(&mut events, |_| true).await {
                ReaderEvent::Batch { session, entries, .. } if session == id => delivered += entries.len(),
                ReaderEvent::EntrySkipped { session, .. } if session == id => skipped_events += 1,
                event @ ReaderEvent::Completed { .. } => break event,
                ReaderEvent::Failed { message, .. } => panic!("session failed: {message}"),
                _ => {},
            }
        };
        assert_eq!((delivered, skipped_events), (10, 1));
        assert!(matches!(completed, ReaderEvent::Completed { total: 10, skipped: 1, from_cache: false, .. }));
        eventually(|| reader.active_streams() == 0).await;
    }

    #[tokio::test]
    async fn test_identical_streams_are_joined() {
        let reader = reader(MockBackend::with_files(pages("series", 40)));
        let first = reader.open_stream("series", ScanOptions::default());
        assert_eq!(reader.open_stream("series", ScanOptions::default()), first);
        let search = reader.open_stream("series", ScanOptions::search("001"));
        assert_ne!(search, first);
        assert_eq!(reader.active_streams(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stream() {
        let reader = reader(MockBackend::with_files(pages("series", 200)));
        let mut events = reader.subscribe();
        let id = reader.open_stream("series", ScanOptions::default());
        assert!(reader.cancel_stream(id));
        assert!(!reader.cancel_stream(id));
        let event = next_matching(&mut events, |event| {
            matches!(event, ReaderEvent::Cancelled { .. } | ReaderEvent::Completed { .. })
        })
        .await;
        assert!(matches!(event, ReaderEvent::Cancelled { session } if session == id));
    }

    #[tokio::test]
    async fn test_missing_root_fails_session() {
        let reader = reader(MockBackend::with_files(pages("series", 1)));
        let mut events = reader.subscribe();
        let id = reader.open_stream("elsewhere", ScanOptions::default());
        let event = next_matching(&mut events, |event| matches!(event, ReaderEvent::Failed { .. })).await;
        assert!(matches!(event, ReaderEvent::Failed { session, .. } if session == id));
    }

    #[tokio::test]
    async fn test_get_page_locks_displayed_page_and_prefetches() {
        let reader = reader(MockBackend::with_files(pages("series", 10)));
        let container = reader.open_container("series").await.unwrap();
        assert_eq!(container.page_count(), 10);

        assert_eq!(&reader.get_page("series", 0).await.unwrap()[..], b"page 0");
        assert_eq!(reader.get_cache_stats().locked_count, 1);
        // Default window: three ahead, one behind.
        eventually(|| reader.get_cache_stats().entry_count == 4).await;

        assert_eq!(&reader.get_page("series", 1).await.unwrap()[..], b"page 1");
        let stats = reader.get_cache_stats();
        assert_eq!(stats.locked_count, 1);
        eventually(|| reader.prefetch_stats().completed >= 4).await;
        assert!(reader.prefetch_stats().skipped_cached > 0);
    }

    #[tokio::test]
    async fn test_unknown_container_and_page() {
        let reader = reader(MockBackend::with_files(pages("series", 2)));
        let err = reader.get_page("series", 0).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ContainerNotOpen(_)));
        reader.open_container("series").await.unwrap();
        let err = reader.get_page("series", 2).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PageOutOfRange(2)));
    }

    #[tokio::test]
    async fn test_small_cache_evicts_pages_behind_reader() {
        let mut config = config();
        config.page_cache.max_bytes = 20;
        config.prefetch.enabled = false;
        let files: Vec<_> = (0..6).map(|i| (format!("series/{i}.png"), vec![i as u8; 6])).collect();
        let reader = Reader::with_index(Arc::new(MockBackend::with_files(files)), config, None);
        reader.open_container("series").await.unwrap();
        for page in 0..4 {
            reader.get_page("series", page).await.unwrap();
        }
        let stats = reader.get_cache_stats();
        assert!(stats.total_bytes <= 20);
        assert_eq!(stats.entry_count, 3);

        // Jump back: the page we just left is now ahead of us.
        reader.notify_position_changed("series", 1, Direction::Backward).unwrap();
        assert!(reader.get_cache_stats().total_bytes <= 20);
    }

    #[tokio::test]
    async fn test_solid_page_pending_until_extracted() {
        let files: Vec<_> = (0..8).map(|i| (format!("{i:03}.png"), format!("page {i}").into_bytes())).collect();
        let borrowed: Vec<_> = files.iter().map(|(name, data)| (name.as_str(), data.as_slice())).collect();
        let backend = MockBackend::with_files([("book.cbt".to_string(), build_tar(&borrowed))]);
        let reader = reader(backend);
        let mut events = reader.subscribe();

        reader.pause_background();
        reader.open_container("book.cbt").await.unwrap();
        assert_eq!(reader.try_get_page("book.cbt", 5).unwrap(), PageRequest::Pending);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reader.get_cache_stats().entry_count, 0);

        reader.resume_background();
        let event = next_matching(&mut events, |event| matches!(event, ReaderEvent::PageReady { .. })).await;
        assert!(matches!(event, ReaderEvent::PageReady { page: 5, .. }));
        assert_eq!(
            reader.try_get_page("book.cbt", 5).unwrap(),
            PageRequest::Ready(Bytes::from_static(b"page 5"))
        );
    }

    #[tokio::test]
    async fn test_paused_extraction_leaves_workers_for_scans() {
        let mut config = config();
        config.workers.max_concurrency = 1;
        let mut files = pages("series", 20);
        let book = pages("book", 8);
        let borrowed: Vec<_> = book.iter().map(|(name, data)| (name.as_str(), data.as_slice())).collect();
        files.push(("book.cbt".to_string(), build_tar(&borrowed)));
        let reader = Reader::with_index(Arc::new(MockBackend::with_files(files)), config, None);
        let mut events = reader.subscribe();

        reader.pause_background();
        reader.open_container("book.cbt").await.unwrap();
        let id = reader.open_stream("series", ScanOptions::default());
        let event = next_matching(&mut events, |event| {
            matches!(event, ReaderEvent::Completed { .. } | ReaderEvent::Failed { .. } | ReaderEvent::Cancelled { .. })
        })
        .await;
        assert!(matches!(event, ReaderEvent::Completed { session, total: 20, .. } if session == id));
        reader.shutdown();
    }

    #[tokio::test]
    async fn test_try_get_page_reports_failure() {
        let backend = Arc::new(MockBackend::with_files(pages("series", 3)));
        let reader = Reader::with_index(backend.clone(), config(), None);
        reader.open_container("series").await.unwrap();
        let mut events = reader.subscribe();
        // The file disappears after the listing was taken.
        backend.remove("series/000.png").await.unwrap();
        assert_eq!(reader.try_get_page("series", 0).unwrap(), PageRequest::Pending);
        let event = next_matching(&mut events, |event| matches!(event, ReaderEvent::PageFailed { .. })).await;
        assert!(matches!(event, ReaderEvent::PageFailed { page: 0, .. }));

        assert!(reader.close_container("series"));
        assert!(!reader.close_container("series"));
        let err = reader.try_get_page("series", 0).unwrap_err();
        assert!(matches!(&*err, ErrorKind::ContainerNotOpen(_)));
    }

    #[tokio::test]
    async fn test_close_container_drops_pages() {
        let mut config = config();
        config.prefetch.enabled = false;
        let reader = Reader::with_index(Arc::new(MockBackend::with_files(pages("series", 3))), config, None);
        reader.open_container("series").await.unwrap();
        reader.get_page("series", 0).await.unwrap();
        reader.get_page("series", 1).await.unwrap();
        assert_eq!(reader.get_cache_stats().entry_count, 2);
        assert!(reader.close_container("series"));
        assert_eq!(reader.get_cache_stats(), CacheStats { max_bytes: reader.config().page_cache.max_bytes, ..CacheStats::default() });
    }

    #[tokio::test]
    async fn test_second_scan_comes_from_index() {
        let db = Database::connect_in_memory().await.unwrap();
        let index = CacheIndex::new(&db, IndexOptions::default());
        let reader = Reader::with_index(Arc::new(MockBackend::with_files(pages("series", 20))), config(), Some(index));
        let mut events = reader.subscribe();
        for expected in [false, true] {
            reader.open_stream("series", ScanOptions::default());
            let event = next_matching(&mut events, |event| matches!(event, ReaderEvent::Completed { .. })).await;
            assert!(matches!(event, ReaderEvent::Completed { total: 20, from_cache, .. } if from_cache == expected));
            eventually(|| reader.active_streams() == 0).await;
        }
        let stats = reader.index_stats().await.unwrap().unwrap();
        assert_eq!((stats.complete, stats.entries), (1, 20));
    }

    #[tokio::test]
    async fn test_new_connects_index_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.index.database = dir.path().join("nested").join("index.sqlite");
        let reader = Reader::new(Arc::new(MockBackend::with_files(pages("series", 1))), config).await.unwrap();
        assert!(reader.index_stats().await.unwrap().is_some());

        let mut config = Config::default();
        config.page_cache.max_bytes = 0;
        let err = Reader::new(Arc::new(MockBackend::with_files(pages("series", 1))), config).await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Config));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let reader = reader(MockBackend::with_files(pages("series", 200)));
        reader.open_container("series").await.unwrap();
        reader.open_stream("series", ScanOptions::default());
        reader.shutdown();
        assert_eq!(reader.active_streams(), 0);
        assert!(reader.get_page("series", 0).await.is_err());
    }
}
