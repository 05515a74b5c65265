//! Typed push notifications for consumers (UI, IPC bridges).

use crate::session::SessionId;
use crate::solid::{ExtractionProgress, ExtractionStatus};
use folio_storage::DirectoryEntry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub enum ReaderEvent {
    Batch { session: SessionId, index: usize, entries: Arc<[DirectoryEntry]> },
    Progress { session: SessionId, loaded: u64, elapsed_ms: u64 },
    EntrySkipped { session: SessionId, path: PathBuf, skipped_count: u64 },
    Completed { session: SessionId, total: u64, skipped: u64, elapsed_ms: u64, from_cache: bool },
    Cancelled { session: SessionId },
    Failed { session: SessionId, path: PathBuf, message: String },
    PageReady { container: PathBuf, page: usize },
    PageFailed { container: PathBuf, page: usize, message: String },
    ExtractionProgress { archive: PathBuf, progress: ExtractionProgress },
    ExtractionFinished { archive: PathBuf, status: ExtractionStatus },
}

/// Fan-out channel for [`ReaderEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and a subscriber that falls more than the buffer behind sees
/// [`RecvError::Lagged`](broadcast::error::RecvError::Lagged).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ReaderEvent>,
}
impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}
impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: ReaderEvent) {
        // Err only means nobody is listening.
        _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.sender.subscribe()
    }
}
