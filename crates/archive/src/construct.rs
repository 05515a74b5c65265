use crate::error::{Error, ErrorKind};
use crate::{ArchiveFormat, Compression};
use std::{path::Path, str::FromStr};

const BZIP2_MAGIC: [u8; 3] = [0x42, 0x5A, 0x68];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
#[cfg(feature = "xz")]
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
#[cfg(feature = "zstd")]
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const ZIP_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const SEVEN_ZIP_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];
const RAR_MAGIC: [u8; 6] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07];
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

impl FromStr for Compression {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "bz2" | "bzip2" => Ok(Compression::Bzip2),
            "gz" | "gzip" => Ok(Compression::Gzip),
            #[cfg(feature = "xz")]
            "xz" | "lzma" => Ok(Compression::Xz),
            #[cfg(not(feature = "xz"))]
            "xz" | "lzma" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            #[cfg(feature = "zstd")]
            "zst" | "zstd" => Ok(Compression::Zstd),
            #[cfg(not(feature = "zstd"))]
            "zst" | "zstd" => exn::bail!(ErrorKind::DisabledFormat(s.to_string())),
            _ => exn::bail!(ErrorKind::UnsupportedFormat(s.to_string())),
        }
    }
}
impl From<&[u8]> for Compression {
    fn from(value: &[u8]) -> Self {
        Compression::from_magic_bytes(value)
    }
}
impl Compression {
    /// Detect compression from a file extension.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| match ext.to_lowercase().as_str() {
                "bz2" | "tbz2" => Compression::Bzip2,
                "gz" | "tgz" => Compression::Gzip,
                #[cfg(feature = "xz")]
                "xz" | "txz" => Compression::Xz,
                #[cfg(feature = "zstd")]
                "zst" | "tzst" => Compression::Zstd,
                _ => Compression::None,
            })
            .unwrap_or(Compression::None)
    }

    /// Detect compression format from magic bytes.
    ///
    /// Returns `None` variant if no magic bytes match or if the input
    /// is too short to detect any format.
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Self {
        if bytes.starts_with(&BZIP2_MAGIC) {
            return Compression::Bzip2;
        }
        if bytes.starts_with(&GZIP_MAGIC) {
            return Compression::Gzip;
        }
        #[cfg(feature = "xz")]
        if bytes.starts_with(&XZ_MAGIC) {
            return Compression::Xz;
        }
        #[cfg(feature = "zstd")]
        if bytes.starts_with(&ZSTD_MAGIC) {
            return Compression::Zstd;
        }
        Compression::None
    }
}

impl ArchiveFormat {
    /// How many bytes [`from_magic_bytes`](Self::from_magic_bytes) needs to
    /// see to recognise every format (the tar signature sits past the first
    /// header block fields).
    pub const MAGIC_LEN: usize = TAR_MAGIC_OFFSET + 5;

    /// Detect a container format from its file name.
    ///
    /// Returns `None` for anything that isn't a recognised archive (including
    /// tarballs compressed with a disabled format).
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let name = path.as_ref().file_name()?.to_str()?.to_lowercase();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            // Dotfiles like `.zip` have no extension.
            return None;
        }
        match ext {
            "zip" | "cbz" => Some(ArchiveFormat::Zip),
            "tar" | "cbt" => Some(ArchiveFormat::Tar(Compression::None)),
            "7z" | "cb7" => Some(ArchiveFormat::SevenZip),
            "rar" | "cbr" => Some(ArchiveFormat::Rar),
            "tgz" | "tbz2" | "txz" | "tzst" => match Compression::from_path(&name) {
                Compression::None => None,
                compression => Some(ArchiveFormat::Tar(compression)),
            },
            _ if stem.ends_with(".tar") => match Compression::from_path(&name) {
                Compression::None => None,
                compression => Some(ArchiveFormat::Tar(compression)),
            },
            _ => None,
        }
    }

    /// Detect an uncompressed container format from its leading bytes.
    ///
    /// Compressed tarballs can't be told apart from any other compressed
    /// stream without decoding, so they are only recognised by
    /// [`from_path`](Self::from_path).
    #[must_use]
    pub fn from_magic_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&ZIP_MAGIC) || bytes.starts_with(&ZIP_EMPTY_MAGIC) {
            return Some(ArchiveFormat::Zip);
        }
        if bytes.starts_with(&SEVEN_ZIP_MAGIC) {
            return Some(ArchiveFormat::SevenZip);
        }
        if bytes.starts_with(&RAR_MAGIC) {
            return Some(ArchiveFormat::Rar);
        }
        if bytes.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()) == Some(TAR_MAGIC) {
            return Some(ArchiveFormat::Tar(Compression::None));
        }
        None
    }

    /// Whether entry K can only be reached by decoding entries 1..K-1 first.
    #[must_use]
    pub fn is_solid(&self) -> bool {
        !matches!(self, ArchiveFormat::Zip)
    }

    /// Whether this crate can actually decode the format.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        matches!(self, ArchiveFormat::Zip | ArchiveFormat::Tar(_) | ArchiveFormat::SevenZip)
    }
}

#[cfg(test)]
mod tests {
    use crate::{ArchiveFormat, Compression};
    use rstest::rstest;

    #[rstest]
    #[case("none", Compression::None)]
    #[case("bz2", Compression::Bzip2)]
    #[case("BZIP2", Compression::Bzip2)]
    #[case("gz", Compression::Gzip)]
    #[case("gzip", Compression::Gzip)]
    #[cfg_attr(feature = "xz", case("xz", Compression::Xz))]
    #[cfg_attr(feature = "xz", case("lzma", Compression::Xz))]
    #[cfg_attr(feature = "zstd", case("zst", Compression::Zstd))]
    fn test_from_str(#[case] test: &str, #[case] expected: Compression) {
        assert_eq!(test.parse::<Compression>().unwrap(), expected);
    }

    #[rstest]
    #[case("invalid")]
    #[case("br")]
    #[case(" ")]
    fn test_from_str_invalid(#[case] test: &str) {
        assert!(test.parse::<Compression>().is_err());
    }

    #[rstest]
    #[case("page.png", Compression::None)]
    #[case(".bz2", Compression::None)]
    #[case("book.tar.bz2", Compression::Bzip2)]
    #[case("book.tgz", Compression::Gzip)]
    #[cfg_attr(feature = "xz", case("book.tar.xz", Compression::Xz))]
    #[cfg_attr(feature = "zstd", case("book.tar.zst", Compression::Zstd))]
    fn test_compression_from_path(#[case] test: &str, #[case] expected: Compression) {
        assert_eq!(Compression::from_path(test), expected);
    }

    #[rstest]
    #[case("book.zip", Some(ArchiveFormat::Zip))]
    #[case("Book.CBZ", Some(ArchiveFormat::Zip))]
    #[case("book.cbt", Some(ArchiveFormat::Tar(Compression::None)))]
    #[case("book.tar", Some(ArchiveFormat::Tar(Compression::None)))]
    #[case("book.tar.gz", Some(ArchiveFormat::Tar(Compression::Gzip)))]
    #[case("book.tgz", Some(ArchiveFormat::Tar(Compression::Gzip)))]
    #[case("book.tar.bz2", Some(ArchiveFormat::Tar(Compression::Bzip2)))]
    #[cfg_attr(feature = "xz", case("book.tar.xz", Some(ArchiveFormat::Tar(Compression::Xz))))]
    #[cfg_attr(feature = "zstd", case("book.tar.zst", Some(ArchiveFormat::Tar(Compression::Zstd))))]
    #[case("book.cb7", Some(ArchiveFormat::SevenZip))]
    #[case("book.rar", Some(ArchiveFormat::Rar))]
    #[case("page.gz", None)]
    #[case("page.jpg", None)]
    #[case(".zip", None)]
    #[case("no-extension", None)]
    fn test_archive_from_path(#[case] test: &str, #[case] expected: Option<ArchiveFormat>) {
        assert_eq!(ArchiveFormat::from_path(test), expected);
    }

    #[test]
    fn test_archive_from_magic_bytes() {
        assert_eq!(ArchiveFormat::from_magic_bytes(b"PK\x03\x04rest"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_magic_bytes(b"Rar!\x1A\x07\x00"), Some(ArchiveFormat::Rar));
        assert_eq!(
            ArchiveFormat::from_magic_bytes(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00]),
            Some(ArchiveFormat::SevenZip)
        );
        let mut header = vec![0u8; 512];
        header[257..262].copy_from_slice(b"ustar");
        assert_eq!(ArchiveFormat::from_magic_bytes(&header), Some(ArchiveFormat::Tar(Compression::None)));
        assert_eq!(ArchiveFormat::from_magic_bytes(b"\x89PNG"), None);
        assert_eq!(ArchiveFormat::from_magic_bytes(&[]), None);
    }

    #[test]
    fn test_solid_and_supported() {
        assert!(!ArchiveFormat::Zip.is_solid());
        assert!(ArchiveFormat::Tar(Compression::Gzip).is_solid());
        assert!(ArchiveFormat::SevenZip.is_solid());
        assert!(ArchiveFormat::Tar(Compression::None).is_supported());
        assert!(ArchiveFormat::SevenZip.is_supported());
        assert!(!ArchiveFormat::Rar.is_supported());
    }

    #[rstest]
    #[case(b"\x89PNG\r\n", Compression::None)]
    #[case(&[], Compression::None)]
    #[case(&[0x42, 0x5A, 0x68, 0x39], Compression::Bzip2)]
    #[case(&[0x1F, 0x8B, 0x08, 0x00], Compression::Gzip)]
    #[cfg_attr(feature = "xz", case(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00], Compression::Xz))]
    #[cfg_attr(feature = "zstd", case(&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd))]
    fn test_compression_from_magic_bytes(#[case] bytes: &[u8], #[case] expected: Compression) {
        assert_eq!(Compression::from_magic_bytes(bytes), expected);
        assert_eq!(<&[u8] as Into<Compression>>::into(bytes), expected);
    }
}
