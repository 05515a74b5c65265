//! Background extraction for archives that can only be decoded front to back.
//!
//! Opening page K of a tarball or 7z means decompressing everything before it, so
//! instead of seeking, one task per archive streams through the whole thing
//! once and parks every page in a temp store. Small payloads stay in memory;
//! large ones, nested archives and anything over the aggregate memory budget
//! are spilled to files in a private temp directory. Readers call
//! [`SolidArchiveExtractor::wait_for_entry`], which suspends until the entry
//! shows up.
//!
//! The status only moves forward: `NotStarted -> InProgress -> {Done,
//! Cancelled, Failed}`. Only an explicit [`restart`](SolidArchiveExtractor::restart)
//! goes back.

use crate::error::{ErrorKind, Result};
use crate::events::{EventBus, ReaderEvent};
use bytes::Bytes;
use derive_more::Display;
use exn::ResultExt;
use folio_archive::{
    ArchiveEntry, ArchiveFormat, Compression, is_page, normalize_entry_name, visit_7z_entries, visit_tar_entries,
};
use folio_config::SolidConfig;
use folio_storage::BackendHandle;
use folio_storage::backend::{BoxSyncRead, BoxSyncReadSeek};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Read;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[display("timed out")]
    Timeout,
    #[display("{_0}")]
    Error(String),
}

#[derive(Debug, Display, Clone, Default, PartialEq, Eq)]
pub enum ExtractionStatus {
    #[default]
    #[display("not started")]
    NotStarted,
    #[display("in progress")]
    InProgress,
    #[display("done")]
    Done,
    #[display("cancelled")]
    Cancelled,
    #[display("failed: {_0}")]
    Failed(FailureReason),
}
impl ExtractionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed(_))
    }

    fn can_become(&self, next: &Self) -> bool {
        match self {
            Self::NotStarted => matches!(next, Self::InProgress | Self::Cancelled),
            Self::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionProgress {
    pub status: ExtractionStatus,
    /// Entries stored so far, in memory or on disk.
    pub produced: usize,
    pub memory_bytes: u64,
    pub spilled: usize,
    /// Entries that couldn't be stored.
    pub failed: usize,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolidOptions {
    /// Entries larger than this are written to disk.
    pub memory_threshold: u64,
    /// Upper bound on the bytes held in memory across all entries.
    pub memory_budget: u64,
    /// Give up on the whole archive after this long. Time spent paused
    /// doesn't count.
    pub timeout: Option<Duration>,
    pub temp_dir: Option<PathBuf>,
}
impl Default for SolidOptions {
    fn default() -> Self {
        Self::from(&SolidConfig::default())
    }
}
impl From<&SolidConfig> for SolidOptions {
    fn from(config: &SolidConfig) -> Self {
        Self {
            memory_threshold: config.memory_threshold,
            memory_budget: config.memory_budget,
            timeout: Some(config.timeout()),
            temp_dir: config.temp_dir.clone(),
        }
    }
}

#[derive(Debug, Clone)]
enum StoredEntry {
    Memory(Bytes),
    TempFile { path: PathBuf, size: u64 },
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, StoredEntry>,
    /// Names in the order they were produced.
    order: Vec<String>,
    failed: HashMap<String, String>,
    memory_bytes: u64,
}

/// What the decode reads from.
enum Source {
    Tar(BoxSyncRead, Compression),
    SevenZip(BoxSyncReadSeek, u64),
}

/// Why the decode loop stopped early.
enum Stop {
    Cancelled,
    TimedOut,
}

struct Shared {
    archive: PathBuf,
    options: SolidOptions,
    temp: TempDir,
    store: RwLock<Store>,
    progress: watch::Sender<ExtractionProgress>,
    paused: watch::Sender<bool>,
    events: Option<EventBus>,
}
impl Shared {
    fn publish(&self, event: ReaderEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn status(&self) -> ExtractionStatus {
        self.progress.borrow().status.clone()
    }

    /// Move the status forward. Returns `false` (and changes nothing) for a
    /// transition that would go backwards.
    fn advance(&self, next: ExtractionStatus) -> bool {
        let advanced = self.progress.send_if_modified(|progress| {
            if !progress.status.can_become(&next) {
                return false;
            }
            progress.status = next.clone();
            true
        });
        if advanced && next.is_terminal() {
            self.publish(ReaderEvent::ExtractionFinished { archive: self.archive.clone(), status: next });
        }
        advanced
    }

    fn spill_path(&self, name: &str) -> PathBuf {
        self.temp.path().join(blake3::hash(name.as_bytes()).to_hex().as_str())
    }

    /// Store one entry. Failures stay with the entry.
    fn store_entry(&self, entry: &ArchiveEntry, data: &mut dyn Read) {
        if self.store.read().entries.contains_key(&entry.name) {
            return;
        }
        let nested = ArchiveFormat::from_path(&entry.name).is_some();
        let over_budget = self.store.read().memory_bytes.saturating_add(entry.size) > self.options.memory_budget;
        let stored = match nested || over_budget || entry.size > self.options.memory_threshold {
            true => self.spill(&entry.name, entry.size, data),
            false => read_to_bytes(data, entry.size).map(StoredEntry::Memory),
        };
        let mut store = self.store.write();
        let stored = match stored {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(archive = %self.archive.display(), entry = %entry.name, error = %err, "could not extract entry");
                store.failed.insert(entry.name.clone(), err.to_string());
                drop(store);
                self.progress.send_modify(|progress| progress.failed += 1);
                return;
            },
        };
        let (memory, spilled) = match &stored {
            StoredEntry::Memory(bytes) => (bytes.len() as u64, false),
            StoredEntry::TempFile { .. } => (0, true),
        };
        store.memory_bytes += memory;
        store.order.push(entry.name.clone());
        store.entries.insert(entry.name.clone(), stored);
        let memory_bytes = store.memory_bytes;
        drop(store);
        // Publish after the entry is visible so waiters can't miss it.
        self.progress.send_modify(|progress| {
            progress.produced += 1;
            progress.memory_bytes = memory_bytes;
            progress.spilled += usize::from(spilled);
        });
        let progress = self.progress.borrow().clone();
        self.publish(ReaderEvent::ExtractionProgress { archive: self.archive.clone(), progress });
    }

    fn spill(&self, name: &str, expected: u64, data: &mut dyn Read) -> std::io::Result<StoredEntry> {
        let path = self.spill_path(name);
        let mut file = std::fs::File::create(&path)?;
        let size = std::io::copy(data, &mut file)?;
        check_length(size, expected)?;
        Ok(StoredEntry::TempFile { path, size })
    }

    /// Decode the archive front to back. Runs on a blocking thread.
    fn decode(&self, source: Source, worker: &mut Worker) -> Result<Option<Stop>> {
        let token = worker.token.clone();
        let mut deadline = self.options.timeout.map(|timeout| Instant::now() + timeout);
        let mut stop = None;
        let visit = |entry: &ArchiveEntry, data: &mut dyn Read| {
            match worker.yield_while_paused(&self.paused) {
                Ok(paused_for) => deadline = deadline.map(|deadline| deadline + paused_for),
                Err(reason) => {
                    stop = Some(reason);
                    return ControlFlow::Break(());
                },
            }
            if token.is_cancelled() {
                stop = Some(Stop::Cancelled);
                return ControlFlow::Break(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                stop = Some(Stop::TimedOut);
                return ControlFlow::Break(());
            }
            if is_page(&entry.name) || ArchiveFormat::from_path(&entry.name).is_some() {
                self.store_entry(entry, data);
            }
            ControlFlow::Continue(())
        };
        match source {
            Source::Tar(reader, compression) => visit_tar_entries(reader, compression, visit),
            Source::SevenZip(reader, len) => visit_7z_entries(reader, len, visit),
        }
        .or_raise(|| ErrorKind::Archive)?;
        Ok(stop)
    }
}

fn read_to_bytes(data: &mut dyn Read, size: u64) -> std::io::Result<Bytes> {
    let mut buffer = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    data.read_to_end(&mut buffer)?;
    check_length(buffer.len() as u64, size)?;
    Ok(Bytes::from(buffer))
}

/// A stream that ends early yields a short read, not an error.
fn check_length(read: u64, expected: u64) -> std::io::Result<()> {
    match read == expected {
        true => Ok(()),
        false => Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("entry truncated: {read} of {expected} bytes"),
        )),
    }
}

/// The pool permit held by a running decode.
///
/// The decode runs on a blocking thread, so pausing drops the permit there
/// and blocks on the runtime until resumed and a permit is free again.
struct Worker {
    permits: Arc<Semaphore>,
    permit: Option<OwnedSemaphorePermit>,
    runtime: Handle,
    token: CancellationToken,
}
impl Worker {
    /// Returns how long the decode was held up, or why to stop.
    fn yield_while_paused(&mut self, paused: &watch::Sender<bool>) -> std::result::Result<Duration, Stop> {
        if !*paused.borrow() {
            return Ok(Duration::ZERO);
        }
        let started = Instant::now();
        self.permit = None;
        let mut paused = paused.subscribe();
        let permits = Arc::clone(&self.permits);
        let token = self.token.clone();
        let permit = self.runtime.block_on(async move {
            let resumed = async {
                paused.wait_for(|paused| !*paused).await.ok()?;
                permits.acquire_owned().await.ok()
            };
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                permit = resumed => permit,
            }
        });
        match permit {
            Some(permit) => {
                self.permit = Some(permit);
                Ok(started.elapsed())
            },
            None => Err(Stop::Cancelled),
        }
    }
}

struct Run {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One background extraction of one solid archive.
///
/// Entries already produced stay readable after the extraction finishes,
/// fails or is cancelled. The temp store is removed when the extractor and
/// its task are both gone.
pub struct SolidArchiveExtractor {
    shared: Arc<Shared>,
    backend: BackendHandle,
    format: ArchiveFormat,
    permits: Arc<Semaphore>,
    run: Mutex<Option<Run>>,
}
impl SolidArchiveExtractor {
    pub fn new(
        backend: BackendHandle,
        archive: impl Into<PathBuf>,
        format: ArchiveFormat,
        options: SolidOptions,
        permits: Arc<Semaphore>,
        events: Option<EventBus>,
    ) -> Result<Self> {
        let archive = archive.into();
        let mut builder = tempfile::Builder::new();
        builder.prefix("folio-");
        let temp = match &options.temp_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .or_raise(|| ErrorKind::ExtractionFailed(archive.display().to_string()))?;
        let shared = Shared {
            archive,
            options,
            temp,
            store: RwLock::default(),
            progress: watch::Sender::new(ExtractionProgress::default()),
            paused: watch::Sender::new(false),
            events,
        };
        Ok(Self { shared: Arc::new(shared), backend, format, permits, run: Mutex::new(None) })
    }

    pub fn archive(&self) -> &Path {
        &self.shared.archive
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn status(&self) -> ExtractionStatus {
        self.shared.status()
    }

    pub fn progress(&self) -> ExtractionProgress {
        self.shared.progress.borrow().clone()
    }

    /// Receiver for progress updates, e.g. to drive a progress bar.
    pub fn watch_progress(&self) -> watch::Receiver<ExtractionProgress> {
        self.shared.progress.subscribe()
    }

    /// Launch the background extraction. Calling it again while one is
    /// running, or after it finished, does nothing.
    #[instrument(skip(self), fields(archive = %self.shared.archive.display()))]
    pub fn start(&self) -> Result<()> {
        if !matches!(self.format, ArchiveFormat::Tar(_) | ArchiveFormat::SevenZip) {
            tracing::warn!(format = ?self.format, "no decoder for solid format");
            exn::bail!(ErrorKind::UnsupportedContainer(self.shared.archive.clone()));
        }
        let mut run = self.run.lock();
        if !self.shared.advance(ExtractionStatus::InProgress) {
            return Ok(());
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(extract(
            Arc::clone(&self.shared),
            Arc::clone(&self.backend),
            self.format,
            Arc::clone(&self.permits),
            token.clone(),
        ));
        *run = Some(Run { token, handle });
        tracing::debug!("started extraction");
        Ok(())
    }

    /// Stop the extraction. Produced entries stay available.
    pub fn cancel(&self) {
        match self.run.lock().as_ref() {
            // The task records the final status once it has stopped.
            Some(run) => run.token.cancel(),
            None => {
                self.shared.advance(ExtractionStatus::Cancelled);
            },
        }
        self.resume();
    }

    /// Hold the extraction between entries until [`resume`](Self::resume).
    /// A paused extraction gives its worker back to the pool.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
        self.shared.progress.send_modify(|progress| progress.paused = true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
        self.shared.progress.send_if_modified(|progress| std::mem::replace(&mut progress.paused, false));
    }

    /// Stop any running extraction and start a fresh pass. Entries already
    /// stored are kept and not extracted twice; failed entries get another
    /// try.
    pub async fn restart(&self) -> Result<()> {
        let previous = self.run.lock().take();
        if let Some(run) = previous {
            run.token.cancel();
            self.resume();
            if let Err(err) = run.handle.await {
                tracing::warn!(archive = %self.shared.archive.display(), error = %err, "extraction task failed");
            }
        }
        let failed = {
            let mut store = self.shared.store.write();
            std::mem::take(&mut store.failed).len()
        };
        self.shared.progress.send_modify(|progress| {
            progress.status = ExtractionStatus::NotStarted;
            progress.failed -= failed.min(progress.failed);
        });
        self.start()
    }

    /// Names of the entries produced so far, in archive order.
    pub fn entry_names(&self) -> Vec<String> {
        self.shared.store.read().order.clone()
    }

    /// An entry if it has already been produced.
    pub async fn try_entry(&self, name: &str) -> Result<Option<Bytes>> {
        let name = normalize_entry_name(name);
        let stored = self.shared.store.read().entries.get(&name).cloned();
        match stored {
            Some(StoredEntry::Memory(bytes)) => Ok(Some(bytes)),
            Some(StoredEntry::TempFile { path, .. }) => {
                let bytes = tokio::fs::read(&path).await.or_raise(|| ErrorKind::ExtractionFailed(name.clone()))?;
                Ok(Some(Bytes::from(bytes)))
            },
            None => Ok(None),
        }
    }

    /// Wait until `name` has been extracted.
    ///
    /// Suspends the calling task (no thread is blocked) until the entry is
    /// produced, the extraction ends without it, or `timeout` elapses.
    #[instrument(skip(self), fields(archive = %self.shared.archive.display()))]
    pub async fn wait_for_entry(&self, name: &str, timeout: Option<Duration>) -> Result<Bytes> {
        let name = normalize_entry_name(name);
        let wait = self.wait(&name);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.or_raise(|| ErrorKind::Timeout)?,
            None => wait.await,
        }
    }

    async fn wait(&self, name: &str) -> Result<Bytes> {
        let mut progress = self.shared.progress.subscribe();
        loop {
            // Mark the current value seen before looking, so an entry stored
            // after the check still wakes us.
            let status = progress.borrow_and_update().status.clone();
            if let Some(bytes) = self.try_entry(name).await? {
                return Ok(bytes);
            }
            if let Some(message) = self.shared.store.read().failed.get(name) {
                exn::bail!(ErrorKind::ExtractionFailed(format!("{name}: {message}")));
            }
            match status {
                ExtractionStatus::NotStarted | ExtractionStatus::InProgress => {},
                ExtractionStatus::Done => exn::bail!(ErrorKind::ExtractionFailed(format!("{name}: not in archive"))),
                ExtractionStatus::Cancelled => exn::bail!(ErrorKind::Cancelled),
                ExtractionStatus::Failed(FailureReason::Timeout) => exn::bail!(ErrorKind::Timeout),
                ExtractionStatus::Failed(FailureReason::Error(message)) => {
                    exn::bail!(ErrorKind::ExtractionFailed(format!("{name}: {message}")))
                },
            }
            if progress.changed().await.is_err() {
                exn::bail!(ErrorKind::Cancelled);
            }
        }
    }
}
impl Drop for SolidArchiveExtractor {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().as_ref() {
            run.token.cancel();
        }
        self.shared.paused.send_replace(false);
    }
}

async fn decode_with_permit(
    shared: &Arc<Shared>,
    backend: &BackendHandle,
    format: ArchiveFormat,
    permits: &Arc<Semaphore>,
    token: CancellationToken,
) -> Result<Option<Stop>> {
    // Paused before it ever ran: don't take a worker yet.
    let mut paused = shared.paused.subscribe();
    let ready = async {
        let resumed = paused.wait_for(|paused| !*paused).await.is_ok();
        match resumed {
            true => Arc::clone(permits).acquire_owned().await.ok(),
            false => None,
        }
    };
    let permit = tokio::select! {
        biased;
        () = token.cancelled() => return Ok(Some(Stop::Cancelled)),
        permit = ready => permit.ok_or_else(|| exn::Exn::from(ErrorKind::Task))?,
    };
    let path = shared.archive.as_path();
    let source = match format {
        ArchiveFormat::Tar(compression) => {
            Source::Tar(backend.reader(path).await.or_raise(|| ErrorKind::Storage)?, compression)
        },
        ArchiveFormat::SevenZip => {
            let len = backend.stat(path).await.or_raise(|| ErrorKind::Storage)?.size;
            Source::SevenZip(backend.seekable_reader(path).await.or_raise(|| ErrorKind::Storage)?, len)
        },
        _ => exn::bail!(ErrorKind::UnsupportedContainer(shared.archive.clone())),
    };
    let mut worker = Worker { permits: Arc::clone(permits), permit: Some(permit), runtime: Handle::current(), token };
    let decoder = Arc::clone(shared);
    tokio::task::spawn_blocking(move || decoder.decode(source, &mut worker))
        .await
        .or_raise(|| ErrorKind::Task)?
}

/// The extraction task: wait for a worker, decode on a blocking thread,
/// record how it ended.
async fn extract(
    shared: Arc<Shared>,
    backend: BackendHandle,
    format: ArchiveFormat,
    permits: Arc<Semaphore>,
    token: CancellationToken,
) {
    let started = Instant::now();
    let status = match decode_with_permit(&shared, &backend, format, &permits, token).await {
        Ok(None) => ExtractionStatus::Done,
        Ok(Some(Stop::Cancelled)) => ExtractionStatus::Cancelled,
        Ok(Some(Stop::TimedOut)) => ExtractionStatus::Failed(FailureReason::Timeout),
        Err(err) => {
            tracing::warn!(archive = %shared.archive.display(), error = ?err, "extraction failed");
            ExtractionStatus::Failed(FailureReason::Error(err.to_string()))
        },
    };
    let produced = shared.progress.borrow().produced;
    tracing::debug!(
        archive = %shared.archive.display(),
        %status,
        produced,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "extraction finished"
    );
    shared.advance(status);
}
