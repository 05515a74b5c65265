//! Registry of live scan and search sessions.

use derive_more::Display;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Identifies a session for as long as it is registered. Ids are never
/// reused within one [`StreamManager`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0}")]
pub struct SessionId(u64);
impl SessionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
pub enum SessionKind {
    #[display("scan")]
    Scan,
    /// Recursive walk keeping entries whose name contains the query
    /// (case-insensitive).
    #[display("search({query})")]
    Search { query: String },
}

#[derive(Debug)]
pub struct StreamSession {
    pub id: SessionId,
    pub path: PathBuf,
    pub kind: SessionKind,
    pub token: CancellationToken,
    pub created_at: OffsetDateTime,
}

/// Result of [`StreamManager::open`].
#[derive(Debug, Clone)]
pub enum Opened {
    /// A new session; the caller is responsible for driving it.
    New(Arc<StreamSession>),
    /// An identical request is already in flight.
    Existing(Arc<StreamSession>),
}
impl Opened {
    pub fn session(&self) -> &Arc<StreamSession> {
        match self {
            Self::New(session) | Self::Existing(session) => session,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Arc<StreamSession>>,
    by_target: HashMap<(PathBuf, SessionKind), SessionId>,
}
impl Registry {
    fn remove(&mut self, id: SessionId) -> Option<Arc<StreamSession>> {
        let session = self.sessions.remove(&id)?;
        let target = (session.path.clone(), session.kind.clone());
        if self.by_target.get(&target) == Some(&id) {
            self.by_target.remove(&target);
        }
        Some(session)
    }
}

/// Owns cancellation and deduplication for streaming sessions.
///
/// At most one live session exists per `(path, kind)`; a second identical
/// request gets the first session back. Every session token is a child of the
/// manager's root token, so [`shutdown`](Self::shutdown) stops everything.
pub struct StreamManager {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    root: CancellationToken,
}
impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}
impl StreamManager {
    pub fn new() -> Self {
        Self { registry: Mutex::default(), next_id: AtomicU64::new(1), root: CancellationToken::new() }
    }

    pub fn open(&self, path: impl Into<PathBuf>, kind: SessionKind) -> Opened {
        let path = path.into();
        let mut registry = self.registry.lock();
        let target = (path, kind);
        if let Some(session) = registry.by_target.get(&target).and_then(|id| registry.sessions.get(id)) {
            tracing::debug!(session = %session.id, path = %session.path.display(), "reusing in-flight session");
            return Opened::Existing(Arc::clone(session));
        }
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (path, kind) = target;
        let session = Arc::new(StreamSession {
            id,
            path: path.clone(),
            kind: kind.clone(),
            token: self.root.child_token(),
            created_at: OffsetDateTime::now_utc(),
        });
        registry.sessions.insert(id, Arc::clone(&session));
        registry.by_target.insert((path, kind), id);
        tracing::debug!(session = %id, path = %session.path.display(), kind = %session.kind, "opened session");
        Opened::New(session)
    }

    /// Signal cancellation and drop the bookkeeping. Returns `false` for an
    /// unknown (or already finished) session.
    pub fn cancel(&self, id: SessionId) -> bool {
        let Some(session) = self.registry.lock().remove(id) else {
            return false;
        };
        session.token.cancel();
        tracing::debug!(session = %id, "cancelled session");
        true
    }

    /// Cancel every session targeting `path`, whatever its kind. Returns how
    /// many were cancelled.
    pub fn cancel_all_for_path(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        let cancelled: Vec<_> = {
            let mut registry = self.registry.lock();
            let ids: Vec<_> = registry.sessions.values().filter(|s| s.path == path).map(|s| s.id).collect();
            ids.into_iter().filter_map(|id| registry.remove(id)).collect()
        };
        for session in &cancelled {
            session.token.cancel();
        }
        if !cancelled.is_empty() {
            tracing::debug!(path = %path.display(), count = cancelled.len(), "cancelled sessions for path");
        }
        cancelled.len()
    }

    /// Forget a session that ran to completion.
    pub fn finish(&self, id: SessionId) {
        self.registry.lock().remove(id);
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<StreamSession>> {
        self.registry.lock().sessions.get(&id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    /// Cancel every session, including ones opened afterwards.
    pub fn shutdown(&self) {
        self.root.cancel();
        let mut registry = self.registry.lock();
        registry.sessions.clear();
        registry.by_target.clear();
    }
}
