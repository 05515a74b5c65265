//! Reader Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors raised by the storage,
//! archive and index crates are wrapped with [`ResultExt::or_raise`] so the
//! full tree is kept.
//!
//! [`ResultExt::or_raise`]: exn::ResultExt::or_raise

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A reader error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for reader operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The directory a scan was started on can't be opened.
    #[display("root unavailable: {}", _0.display())]
    RootUnavailable(#[error(not(source))] PathBuf),
    /// One archive entry couldn't be produced. Its siblings are unaffected.
    #[display("extraction failed: {_0}")]
    ExtractionFailed(#[error(not(source))] String),
    #[display("operation timed out")]
    Timeout,
    /// The operation was cancelled by the caller. Not a failure.
    #[display("operation cancelled")]
    Cancelled,
    /// A stored directory snapshot couldn't be decoded and will be rebuilt.
    #[display("snapshot corrupted: {}", _0.display())]
    SnapshotCorrupted(#[error(not(source))] PathBuf),
    #[display("no open container at {}", _0.display())]
    ContainerNotOpen(#[error(not(source))] PathBuf),
    #[display("unsupported container: {}", _0.display())]
    UnsupportedContainer(#[error(not(source))] PathBuf),
    #[display("page {_0} out of range")]
    PageOutOfRange(#[error(not(source))] usize),
    /// The payload is larger than the cache, or everything else is locked.
    #[display("page of {_0} bytes does not fit in the cache")]
    CacheFull(#[error(not(source))] u64),
    #[display("storage error")]
    Storage,
    #[display("archive error")]
    Archive,
    #[display("snapshot index error")]
    Index,
    #[display("configuration error")]
    Config,
    #[display("background task failed")]
    Task,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Storage | Self::Index | Self::Task)
    }

    /// Returns `true` if the operation stopped because it was asked to, which
    /// callers shouldn't report as an error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
