//! Archive and compression formats for paged image containers.
//!
//! This crate answers two questions for the reader core:
//!
//! - **What is this file?** Stream compression is detected from extensions
//!   ([`Compression::from_path`]) or magic bytes ([`Compression::from_magic_bytes`]),
//!   and containers via [`ArchiveFormat::from_path`] / [`ArchiveFormat::from_magic_bytes`].
//! - **How do I get the pages out?** Random-access containers (zip/cbz) are
//!   read one entry at a time with [`ZipReader`]. Solid containers (the tar
//!   family and 7z) can only be decoded front to back, see
//!   [`visit_tar_entries`] and [`visit_7z_entries`].
//!
//! Everything in here is synchronous `std::io`. Callers are expected to run
//! it inside `spawn_blocking`.
//!
//! Bzip2 and Gzip are always available. XZ and Zstd are behind feature flags
//! (enabled by default).

mod construct;
pub mod error;
mod ops;
mod page;
mod random;
mod sequential;
mod sevenz;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
mod util;

pub use crate::page::{is_page, natural_cmp, normalize_entry_name};
pub use crate::random::ZipReader;
pub use crate::sequential::{list_plain_tar_entries, list_tar_entries, visit_tar_entries};
pub use crate::sevenz::{list_7z_entries, visit_7z_entries};

/// A supported stream compression format.
///
/// Variants gated behind feature flags (`xz`, `zstd`) are only available when
/// the corresponding feature is enabled. Defaults to [`None`](Self::None)
/// (uncompressed).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Uncompressed
    #[default]
    None,
    /// Bzip2 compression (.bz2)
    Bzip2,
    /// Gzip compression (.gz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    #[cfg(feature = "xz")]
    Xz,
    /// Zstd compression (.zst)
    #[cfg(feature = "zstd")]
    Zstd,
}

/// A container format holding pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// Zip (.zip, .cbz). Has a central directory, so any entry can be read
    /// without touching the others.
    Zip,
    /// Tar (.tar, .cbt), optionally wrapped in a stream compression
    /// (.tar.gz, .tgz, .tar.bz2, .tar.xz, .tar.zst).
    Tar(Compression),
    /// 7-Zip (.7z, .cb7). Listed from its header, decoded front to back.
    SevenZip,
    /// RAR (.rar, .cbr). Recognised, no decoder.
    Rar,
}

/// Metadata for a single file inside an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Normalized entry name (forward slashes, no leading `./`).
    pub name: String,
    /// Uncompressed size in bytes, as recorded by the archive.
    pub size: u64,
}
