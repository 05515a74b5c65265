//! Random-access reads from zip/cbz containers.

use crate::ArchiveEntry;
use crate::error::{ErrorKind, Result};
use crate::page::normalize_entry_name;
use exn::ResultExt;
use std::collections::HashMap;
use std::io::{Read, Seek};
use tracing::instrument;
use zip::ZipArchive;

/// Reads individual entries from a zip archive without decoding the rest.
///
/// Entry names are normalized on open, so lookups with either separator
/// style succeed.
pub struct ZipReader<R> {
    archive: ZipArchive<R>,
    /// Normalized name to central directory index.
    index: HashMap<String, usize>,
    entries: Vec<ArchiveEntry>,
}

impl<R: Read + Seek> ZipReader<R> {
    /// Parse the central directory.
    #[instrument(skip(reader))]
    pub fn new(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader).or_raise(|| ErrorKind::InvalidData)?;
        let mut index = HashMap::with_capacity(archive.len());
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            // Raw access reads the header only, so entries using a
            // compression method we can't decode are still listed.
            let file = archive.by_index_raw(i).or_raise(|| ErrorKind::InvalidData)?;
            if file.is_dir() {
                continue;
            }
            let name = normalize_entry_name(file.name());
            entries.push(ArchiveEntry { name: name.clone(), size: file.size() });
            index.insert(name, i);
        }
        Ok(Self { archive, index, entries })
    }

    /// All file entries, in central directory order.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Decode a single entry into memory.
    #[instrument(skip(self))]
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let name = normalize_entry_name(name);
        let position = *self.index.get(&name).ok_or_else(|| exn::Exn::from(ErrorKind::EntryNotFound(name.clone())))?;
        let mut file = self.archive.by_index(position).or_raise(|| ErrorKind::InvalidData)?;
        let mut buffer = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut buffer).or_raise(|| ErrorKind::InvalidData)?;
        Ok(buffer)
    }
}
