//! Persisted directory snapshot index.
//!
//! Re-walking a large directory every time it is opened is the slowest part
//! of browsing. This crate stores the last complete listing of each directory
//! in SQLite, keyed by path and validated against the directory's live
//! modification time. The database is never the source of truth: any
//! snapshot may be dropped at any time (staleness, corruption, eviction) and
//! the directory simply gets scanned again.
//!
//! # Architecture
//! - **DirectorySnapshot**: one row per directory, with its stored mtime,
//!   completeness flag and access statistics.
//! - **Snapshot entries**: the ordered listing, appended batch by batch while
//!   a scan is in flight and only served once the snapshot is marked
//!   complete.

mod db;
pub mod error;
mod index;
mod models;

pub use crate::db::Database;
pub use crate::index::{CacheIndex, IndexOptions, IndexStats, Lookup};
pub use crate::models::DirectorySnapshot;
