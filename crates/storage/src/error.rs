//! Errors raised by storage backends.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong, at the granularity a scanner needs to decide between
/// skipping an entry and giving up on a directory.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Nothing at this path.
    #[display("not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// A directory operation was attempted on something else
    #[display("not a directory: {}", _0.display())]
    NotADirectory(#[error(not(source))] PathBuf),
    #[display("io: {_0}")]
    Io(IoError),
    /// Null bytes, or `..` climbing out of the backend root.
    #[display("rejected path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    #[display("{_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Transient failures; the same call may work a second time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::BackendError(_))
    }
}
