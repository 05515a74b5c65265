//! Errors raised while detecting or decoding archives.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A decoder could not be set up.
    Decoder,
    /// Malformed archive or stream. Reading it again gives the same result.
    #[display("corrupt archive data")]
    InvalidData,
    /// Recognised, but there is no decoder for it (rar).
    #[display("unsupported format: {_0}")]
    UnsupportedFormat(#[error(not(source))] String),
    /// Compiled out by a cargo feature.
    #[display("disabled format: {_0}")]
    DisabledFormat(#[error(not(source))] String),
    #[display("entry not found: {_0}")]
    EntryNotFound(#[error(not(source))] String),
    #[display("archive read failed")]
    Io,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        *self == Self::Io
    }
}
