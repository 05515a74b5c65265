use crate::{ArchiveFormat, Compression};
use std::fmt::{Display, Formatter, Result as FmtResult};

impl Compression {
    /// Short lowercase name, as used in configuration and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            #[cfg(feature = "xz")]
            Compression::Xz => "xz",
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl Display for ArchiveFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ArchiveFormat::Zip => f.write_str("zip"),
            ArchiveFormat::Tar(Compression::None) => f.write_str("tar"),
            ArchiveFormat::Tar(compression) => write!(f, "tar+{compression}"),
            ArchiveFormat::SevenZip => f.write_str("7z"),
            ArchiveFormat::Rar => f.write_str("rar"),
        }
    }
}
