//! Background read-ahead around the viewing position.
//!
//! Every position change produces a window of pages ahead of and behind the
//! current one, ordered by distance (travel direction first at equal
//! distance). Targets that fall out of the window are cancelled; targets
//! still inside keep running. Prefetches never start while a foreground
//! fetch is in progress.

use crate::error::Result;
use crate::page_cache::Direction;
use async_trait::async_trait;
use folio_config::PrefetchConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore, watch};
use tokio_util::sync::CancellationToken;

/// Loads one page into wherever pages are kept.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, container: &Path, page: usize, token: CancellationToken) -> Result<()>;

    fn is_cached(&self, container: &Path, page: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchOptions {
    pub enabled: bool,
    /// Pages in the direction of travel.
    pub ahead: usize,
    /// Pages against the direction of travel.
    pub behind: usize,
    pub concurrency: usize,
}
impl Default for PrefetchOptions {
    fn default() -> Self {
        Self::from(&PrefetchConfig::default())
    }
}
impl From<&PrefetchConfig> for PrefetchOptions {
    fn from(config: &PrefetchConfig) -> Self {
        Self { enabled: config.enabled, ahead: config.ahead, behind: config.behind, concurrency: config.concurrency }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchStats {
    pub requests: u64,
    pub skipped_cached: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    skipped_cached: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}
impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PrefetchStats {
        PrefetchStats {
            requests: self.requests.load(Ordering::Relaxed),
            skipped_cached: self.skipped_cached.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Tracks foreground fetches so background work can stay out of their way.
#[derive(Debug, Default)]
pub struct ForegroundGate {
    active: AtomicUsize,
    idle: Notify,
}
impl ForegroundGate {
    /// Mark a foreground fetch as running until the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> ForegroundGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ForegroundGuard { gate: Arc::clone(self) }
    }

    pub fn is_idle(&self) -> bool {
        self.active.load(Ordering::Acquire) == 0
    }

    /// Resolve once no foreground fetch is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

pub struct ForegroundGuard {
    gate: Arc<ForegroundGate>,
}
impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        if self.gate.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gate.idle.notify_waiters();
        }
    }
}

/// Pages to prefetch around `current`, highest priority first.
pub fn plan(current: usize, direction: Direction, ahead: usize, behind: usize, page_count: usize) -> Vec<usize> {
    let step = |distance: usize, forward: bool| match forward {
        true => current.checked_add(distance).filter(|page| *page < page_count),
        false => current.checked_sub(distance),
    };
    let travelling_forward = direction == Direction::Forward;
    let mut targets = Vec::with_capacity(ahead + behind);
    for distance in 1..=ahead.max(behind) {
        if distance <= ahead {
            targets.extend(step(distance, travelling_forward));
        }
        if distance <= behind {
            targets.extend(step(distance, !travelling_forward));
        }
    }
    targets
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    /// Handed to a worker; otherwise still waiting in the queue.
    started: bool,
}

#[derive(Default)]
struct State {
    container: Option<PathBuf>,
    in_flight: HashMap<usize, InFlight>,
    /// Targets not yet started, highest priority first.
    queue: VecDeque<usize>,
    next_generation: u64,
}
impl State {
    /// Drop one target. Queued targets are counted here, running ones by
    /// their task once it notices the cancellation.
    fn cancel(target: InFlight, counters: &Counters) {
        target.token.cancel();
        if !target.started {
            Counters::bump(&counters.cancelled);
        }
    }

    fn cancel_all(&mut self, counters: &Counters) {
        self.queue.clear();
        for (_, target) in self.in_flight.drain() {
            Self::cancel(target, counters);
        }
    }

    /// The most wanted queued target, marked as started.
    fn pop(&mut self) -> Option<(PathBuf, usize, u64, CancellationToken)> {
        let container = self.container.clone()?;
        while let Some(page) = self.queue.pop_front() {
            if let Some(target) = self.in_flight.get_mut(&page).filter(|target| !target.started) {
                target.started = true;
                return Some((container, page, target.generation, target.token.clone()));
            }
        }
        None
    }
}

struct Shared {
    fetcher: Arc<dyn PageFetcher>,
    permits: Arc<Semaphore>,
    gate: Arc<ForegroundGate>,
    state: Mutex<State>,
    /// Wakes the dispatcher when the queue changes.
    queued: Notify,
    paused: watch::Sender<bool>,
    counters: Counters,
    root: CancellationToken,
}

/// Schedules prefetches through a bounded pool.
///
/// A single dispatcher hands queued targets to workers strictly in priority
/// order: it takes a pool permit first and only then picks the best target
/// still wanted, so with a pool of `n` at most `n` fetches run at once and a
/// re-plan can reorder everything that hasn't started yet.
pub struct Prefetcher {
    options: PrefetchOptions,
    shared: Arc<Shared>,
    dispatching: AtomicBool,
}
impl Prefetcher {
    pub fn new(fetcher: Arc<dyn PageFetcher>, options: PrefetchOptions, gate: Arc<ForegroundGate>) -> Self {
        let shared = Shared {
            fetcher,
            permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
            gate,
            state: Mutex::default(),
            queued: Notify::new(),
            paused: watch::Sender::new(false),
            counters: Counters::default(),
            root: CancellationToken::new(),
        };
        Self { options, shared: Arc::new(shared), dispatching: AtomicBool::new(false) }
    }

    pub fn options(&self) -> &PrefetchOptions {
        &self.options
    }

    /// Re-plan around a new position. Returns the pages newly scheduled.
    pub fn update(&self, container: impl AsRef<Path>, page_count: usize, current: usize, direction: Direction) -> Vec<usize> {
        if !self.options.enabled || self.shared.root.is_cancelled() {
            return Vec::new();
        }
        let container = container.as_ref();
        let counters = &self.shared.counters;
        let window = plan(current, direction, self.options.ahead, self.options.behind, page_count);
        let mut state = self.shared.state.lock();
        if state.container.as_deref() != Some(container) {
            state.cancel_all(counters);
            state.container = Some(container.to_path_buf());
        }
        let dropped: Vec<_> = state.in_flight.keys().copied().filter(|page| !window.contains(page)).collect();
        for page in dropped {
            if let Some(target) = state.in_flight.remove(&page) {
                State::cancel(target, counters);
            }
        }

        let mut queue = VecDeque::with_capacity(window.len());
        let mut scheduled = Vec::new();
        for page in window {
            match state.in_flight.get(&page) {
                Some(target) if target.started => continue,
                // Still waiting: keep it, at its new priority.
                Some(_) => {
                    queue.push_back(page);
                    continue;
                },
                None => {},
            }
            if self.shared.fetcher.is_cached(container, page) {
                Counters::bump(&counters.skipped_cached);
                continue;
            }
            Counters::bump(&counters.requests);
            let generation = state.next_generation;
            state.next_generation += 1;
            let token = self.shared.root.child_token();
            state.in_flight.insert(page, InFlight { generation, token, started: false });
            queue.push_back(page);
            scheduled.push(page);
        }
        state.queue = queue;
        drop(state);

        if !scheduled.is_empty() {
            tracing::trace!(container = %container.display(), current, ?scheduled, "scheduled prefetch");
        }
        if !self.dispatching.swap(true, Ordering::AcqRel) {
            tokio::spawn(dispatch(Arc::clone(&self.shared)));
        }
        self.shared.queued.notify_one();
        scheduled
    }

    /// Pages currently queued or being fetched.
    pub fn in_flight(&self) -> Vec<usize> {
        let mut pages: Vec<_> = self.shared.state.lock().in_flight.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Cancel everything queued or running, e.g. when the container closes.
    pub fn cancel_all(&self) {
        let mut state = self.shared.state.lock();
        state.cancel_all(&self.shared.counters);
        state.container = None;
    }

    /// Hold queued prefetches before they start. Running fetches finish.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    pub fn stats(&self) -> PrefetchStats {
        self.shared.counters.snapshot()
    }

    /// Cancel all work and refuse new work.
    pub fn shutdown(&self) {
        self.shared.root.cancel();
        self.cancel_all();
    }
}
impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shared.root.cancel();
    }
}

/// Hand queued targets to workers, one pool permit at a time.
async fn dispatch(shared: Arc<Shared>) {
    let mut paused = shared.paused.subscribe();
    loop {
        let ready = async {
            paused.wait_for(|paused| !*paused).await.ok()?;
            let permit = Arc::clone(&shared.permits).acquire_owned().await.ok()?;
            shared.gate.wait_idle().await;
            Some(permit)
        };
        let permit = tokio::select! {
            biased;
            () = shared.root.cancelled() => return,
            permit = ready => match permit {
                Some(permit) => permit,
                None => return,
            },
        };
        let next = shared.state.lock().pop();
        let Some((container, page, generation, token)) = next else {
            drop(permit);
            tokio::select! {
                () = shared.root.cancelled() => return,
                () = shared.queued.notified() => continue,
            }
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let _permit = permit;
            let counters = &shared.counters;
            let counter = if token.is_cancelled() {
                &counters.cancelled
            } else if shared.fetcher.is_cached(&container, page) {
                &counters.skipped_cached
            } else {
                match shared.fetcher.fetch(&container, page, token.clone()).await {
                    Ok(()) => &counters.completed,
                    Err(err) if err.is_cancelled() || token.is_cancelled() => &counters.cancelled,
                    Err(err) => {
                        tracing::debug!(container = %container.display(), page, error = %err, "prefetch failed");
                        &counters.failed
                    },
                }
            };
            Counters::bump(counter);
            let mut state = shared.state.lock();
            if state.in_flight.get(&page).is_some_and(|target| target.generation == generation) {
                state.in_flight.remove(&page);
            }
        });
    }
}
