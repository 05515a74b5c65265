//! Page containers: plain directories and archives.

use crate::error::{ErrorKind, Result};
use crate::events::EventBus;
use crate::solid::{SolidArchiveExtractor, SolidOptions};
use bytes::Bytes;
use exn::ResultExt;
use folio_archive::{
    ArchiveEntry, ArchiveFormat, Compression, ZipReader, is_page, list_7z_entries, list_plain_tar_entries, natural_cmp,
    visit_tar_entries,
};
use folio_storage::BackendHandle;
use folio_storage::backend::BoxSyncReadSeek;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Directory,
    Archive(ArchiveFormat),
}

/// A directory or archive and its pages in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub path: PathBuf,
    pub kind: ContainerKind,
    /// Page names (file names, or archive entry names), naturally sorted.
    pub pages: Vec<String>,
}
impl Container {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_name(&self, index: usize) -> Result<&str> {
        self.pages.get(index).map(String::as_str).ok_or_else(|| exn::Exn::from(ErrorKind::PageOutOfRange(index)))
    }

    fn sorted(path: PathBuf, kind: ContainerKind, names: impl IntoIterator<Item = String>) -> Self {
        let mut pages: Vec<_> = names.into_iter().filter(|name| is_page(name)).collect();
        pages.sort_by(|a, b| natural_cmp(a, b));
        Self { path, kind, pages }
    }
}

enum PageSource {
    Directory,
    Zip(Arc<Mutex<ZipReader<BoxSyncReadSeek>>>),
    Solid(Arc<SolidArchiveExtractor>),
}

/// Shared resources handed to every container on open.
#[derive(Clone)]
pub struct OpenOptions {
    pub solid: SolidOptions,
    /// Worker pool solid extractions run under.
    pub permits: Arc<Semaphore>,
    pub events: Option<EventBus>,
    /// Hold a solid extraction until it is resumed.
    pub start_paused: bool,
    /// Abandons a listing that has to decode the whole archive.
    pub cancel: CancellationToken,
}

/// A container ready to serve page bytes.
pub struct OpenContainer {
    container: Container,
    source: PageSource,
    backend: BackendHandle,
}
impl OpenContainer {
    #[instrument(skip(backend, options))]
    pub async fn open(backend: BackendHandle, path: &Path, options: &OpenOptions) -> Result<Self> {
        let entry = backend.stat(path).await.or_raise(|| ErrorKind::Storage)?;
        if entry.is_dir() {
            let names = backend.read_dir(path).await.or_raise(|| ErrorKind::Storage)?;
            let names = names.into_iter().filter(|entry| !entry.is_dir() && !entry.is_hidden()).map(|entry| entry.name);
            let container = Container::sorted(path.to_path_buf(), ContainerKind::Directory, names);
            tracing::debug!(pages = container.page_count(), "opened directory");
            return Ok(Self { container, source: PageSource::Directory, backend });
        }

        let format = detect(&backend, path).await?;
        if !format.is_supported() {
            tracing::warn!(?format, "archive format has no decoder");
            exn::bail!(ErrorKind::UnsupportedContainer(path.to_path_buf()));
        }
        let kind = ContainerKind::Archive(format);
        let (container, source) = match format {
            ArchiveFormat::Tar(_) | ArchiveFormat::SevenZip => {
                let entries = list_solid(&backend, path, format, entry.size, options).await?;
                let container = Container::sorted(path.to_path_buf(), kind, entries.into_iter().map(|entry| entry.name));
                let extractor = SolidArchiveExtractor::new(
                    Arc::clone(&backend),
                    path,
                    format,
                    options.solid.clone(),
                    Arc::clone(&options.permits),
                    options.events.clone(),
                )?;
                if options.start_paused {
                    extractor.pause();
                }
                extractor.start()?;
                (container, PageSource::Solid(Arc::new(extractor)))
            },
            ArchiveFormat::Zip | ArchiveFormat::Rar => {
                let reader = backend.seekable_reader(path).await.or_raise(|| ErrorKind::Storage)?;
                let zip = tokio::task::spawn_blocking(move || ZipReader::new(reader))
                    .await
                    .or_raise(|| ErrorKind::Task)?
                    .or_raise(|| ErrorKind::Archive)?;
                let names = zip.entries().iter().map(|entry| entry.name.clone()).collect::<Vec<_>>();
                let container = Container::sorted(path.to_path_buf(), kind, names);
                (container, PageSource::Zip(Arc::new(Mutex::new(zip))))
            },
        };
        tracing::debug!(?format, pages = container.page_count(), "opened archive");
        Ok(Self { container, source, backend })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn path(&self) -> &Path {
        &self.container.path
    }

    pub fn extractor(&self) -> Option<&Arc<SolidArchiveExtractor>> {
        match &self.source {
            PageSource::Solid(extractor) => Some(extractor),
            _ => None,
        }
    }

    /// Read one page. For solid archives this waits (up to `timeout`) for the
    /// background extraction to reach it.
    pub async fn read_page(&self, index: usize, timeout: Option<Duration>) -> Result<Bytes> {
        let name = self.container.page_name(index)?;
        match &self.source {
            PageSource::Directory => {
                let bytes = self.backend.read(&self.container.path.join(name)).await.or_raise(|| ErrorKind::Storage)?;
                Ok(Bytes::from(bytes))
            },
            PageSource::Zip(zip) => {
                let zip = Arc::clone(zip);
                let name = name.to_string();
                let bytes = tokio::task::spawn_blocking(move || zip.lock().read_entry(&name))
                    .await
                    .or_raise(|| ErrorKind::Task)?
                    .or_raise(|| ErrorKind::Archive)?;
                Ok(Bytes::from(bytes))
            },
            PageSource::Solid(extractor) => extractor.wait_for_entry(name, timeout).await,
        }
    }

    /// Stop any background work for this container.
    pub fn close(&self) {
        if let PageSource::Solid(extractor) = &self.source {
            extractor.cancel();
        }
    }
}

/// List a solid archive's entries.
///
/// Plain tarballs and 7z have headers that can be read without touching
/// entry data. A compressed tarball has to be decoded in full, so that runs
/// as pool work and stops early once `options.cancel` fires.
async fn list_solid(
    backend: &BackendHandle,
    path: &Path,
    format: ArchiveFormat,
    size: u64,
    options: &OpenOptions,
) -> Result<Vec<ArchiveEntry>> {
    let listing = match format {
        ArchiveFormat::Tar(Compression::None) => {
            let reader = backend.seekable_reader(path).await.or_raise(|| ErrorKind::Storage)?;
            tokio::task::spawn_blocking(move || list_plain_tar_entries(reader)).await
        },
        ArchiveFormat::SevenZip => {
            let reader = backend.seekable_reader(path).await.or_raise(|| ErrorKind::Storage)?;
            tokio::task::spawn_blocking(move || list_7z_entries(reader, size)).await
        },
        ArchiveFormat::Tar(compression) => {
            let permit = tokio::select! {
                () = options.cancel.cancelled() => exn::bail!(ErrorKind::Cancelled),
                permit = Arc::clone(&options.permits).acquire_owned() => permit.or_raise(|| ErrorKind::Task)?,
            };
            let reader = backend.reader(path).await.or_raise(|| ErrorKind::Storage)?;
            let token = options.cancel.clone();
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let mut listed = Vec::new();
                visit_tar_entries(reader, compression, |entry, _| {
                    if token.is_cancelled() {
                        return ControlFlow::Break(());
                    }
                    listed.push(entry.clone());
                    ControlFlow::Continue(())
                })
                .map(|_| listed)
            })
            .await
        },
        ArchiveFormat::Zip | ArchiveFormat::Rar => exn::bail!(ErrorKind::UnsupportedContainer(path.to_path_buf())),
    };
    let entries = listing.or_raise(|| ErrorKind::Task)?.or_raise(|| ErrorKind::Archive)?;
    if options.cancel.is_cancelled() {
        exn::bail!(ErrorKind::Cancelled);
    }
    Ok(entries)
}

/// Work out the archive format, by name first and then by content.
async fn detect(backend: &BackendHandle, path: &Path) -> Result<ArchiveFormat> {
    if let Some(format) = ArchiveFormat::from_path(path) {
        return Ok(format);
    }
    let head = backend.read_head(path, ArchiveFormat::MAGIC_LEN).await.or_raise(|| ErrorKind::Storage)?;
    ArchiveFormat::from_magic_bytes(&head).ok_or_else(|| exn::Exn::from(ErrorKind::UnsupportedContainer(path.to_path_buf())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_archive::testing::{build_7z, build_tar, build_zip, compress};
    use folio_storage::backend::MockBackend;

    fn options() -> OpenOptions {
        OpenOptions {
            solid: SolidOptions::default(),
            permits: Arc::new(Semaphore::new(2)),
            events: None,
            start_paused: false,
            cancel: CancellationToken::new(),
        }
    }

    fn backend(files: Vec<(&str, Vec<u8>)>) -> BackendHandle {
        Arc::new(MockBackend::with_files(files))
    }

    #[tokio::test]
    async fn test_directory_pages_in_natural_order() {
        let backend = backend(vec![
            ("series/10.png", b"ten".to_vec()),
            ("series/2.png", b"two".to_vec()),
            ("series/notes.txt", b"-".to_vec()),
            ("series/.cover.png", b"-".to_vec()),
            ("series/extras/1.png", b"-".to_vec()),
        ]);
        let open = OpenContainer::open(backend, Path::new("series"), &options()).await.unwrap();
        assert_eq!(open.container().kind, ContainerKind::Directory);
        assert_eq!(open.container().pages, vec!["2.png", "10.png"]);
        assert_eq!(&open.read_page(1, None).await.unwrap()[..], b"ten");
    }

    #[tokio::test]
    async fn test_zip_pages() {
        let zip = build_zip(&[("b/002.jpg", b"second"), ("b/001.jpg", b"first"), ("ComicInfo.xml", b"<x/>")]);
        let backend = backend(vec![("book.cbz", zip)]);
        let open = OpenContainer::open(backend, Path::new("book.cbz"), &options()).await.unwrap();
        assert_eq!(open.container().kind, ContainerKind::Archive(ArchiveFormat::Zip));
        assert_eq!(open.container().pages, vec!["b/001.jpg", "b/002.jpg"]);
        assert_eq!(&open.read_page(0, None).await.unwrap()[..], b"first");
        assert!(open.extractor().is_none());
    }

    #[tokio::test]
    async fn test_zip_detected_by_content() {
        let zip = build_zip(&[("001.png", b"one")]);
        let backend = backend(vec![("download", zip)]);
        let open = OpenContainer::open(backend, Path::new("download"), &options()).await.unwrap();
        assert_eq!(open.container().kind, ContainerKind::Archive(ArchiveFormat::Zip));
    }

    #[tokio::test]
    async fn test_solid_pages_come_from_extractor() {
        let tar = build_tar(&[("002.png", b"second"), ("001.png", b"first")]);
        let backend = backend(vec![("book.cbt", tar)]);
        let open = OpenContainer::open(backend, Path::new("book.cbt"), &options()).await.unwrap();
        assert_eq!(open.container().pages, vec!["001.png", "002.png"]);
        assert!(open.extractor().is_some());
        assert_eq!(&open.read_page(1, None).await.unwrap()[..], b"second");
        open.close();
    }

    #[tokio::test]
    async fn test_7z_pages_come_from_extractor() {
        let archive = build_7z(&[("002.png", b"second"), ("001.png", b"first"), ("notes.txt", b"-")]);
        let backend = backend(vec![("book.cb7", archive)]);
        let open = OpenContainer::open(backend, Path::new("book.cb7"), &options()).await.unwrap();
        assert_eq!(open.container().kind, ContainerKind::Archive(ArchiveFormat::SevenZip));
        assert_eq!(open.container().pages, vec!["001.png", "002.png"]);
        assert_eq!(&open.read_page(0, None).await.unwrap()[..], b"first");
        open.close();
    }

    #[tokio::test]
    async fn test_compressed_listing_waits_for_a_worker() {
        let tar = build_tar(&[("002.png", b"second"), ("001.png", b"first")]);
        let backend = backend(vec![("book.tar.gz", compress(Compression::Gzip, &tar))]);
        let options = OpenOptions { permits: Arc::new(Semaphore::new(0)), start_paused: true, ..options() };

        let opening = tokio::spawn({
            let options = options.clone();
            async move {
                let open = OpenContainer::open(backend, Path::new("book.tar.gz"), &options).await?;
                Ok::<_, crate::error::Error>(open.container().clone())
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!opening.is_finished());

        options.permits.add_permits(1);
        let container = opening.await.unwrap().unwrap();
        assert_eq!(container.pages, vec!["001.png", "002.png"]);
        assert_eq!(options.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_compressed_listing_is_cancellable() {
        let tar = build_tar(&[("001.png", b"first")]);
        let backend = backend(vec![("book.tar.gz", compress(Compression::Gzip, &tar))]);
        let options = OpenOptions { permits: Arc::new(Semaphore::new(0)), ..options() };
        let opening = tokio::spawn({
            let options = options.clone();
            async move { OpenContainer::open(backend, Path::new("book.tar.gz"), &options).await.err() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        options.cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), opening).await.unwrap().unwrap().unwrap();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_unsupported_and_unknown_containers() {
        let backend = backend(vec![("book.cbr", b"Rar!\x1a\x07\x00".to_vec()), ("notes.bin", b"nothing".to_vec())]);
        for path in ["book.cbr", "notes.bin"] {
            let err = OpenContainer::open(Arc::clone(&backend), Path::new(path), &options()).await.err().unwrap();
            assert!(matches!(&*err, ErrorKind::UnsupportedContainer(_)), "{path}");
        }
    }

    #[tokio::test]
    async fn test_page_out_of_range() {
        let backend = backend(vec![("series/1.png", b"one".to_vec())]);
        let open = OpenContainer::open(backend, Path::new("series"), &options()).await.unwrap();
        let err = open.read_page(1, None).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PageOutOfRange(1)));
    }
}
