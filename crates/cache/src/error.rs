//! Errors raised by the snapshot index.

use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A value couldn't be converted to or from its column representation.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// A stored snapshot can't be decoded. Drop it and rescan.
    #[display("snapshot corrupted: {}", _0.display())]
    SnapshotCorrupted(#[error(not(source))] PathBuf),
    /// Entries were appended to a snapshot that was never begun (or was
    /// already completed).
    #[display("no snapshot in progress: {}", _0.display())]
    NotInProgress(#[error(not(source))] PathBuf),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }
}
