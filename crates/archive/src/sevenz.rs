//! 7-Zip (7z/cb7) containers.
//!
//! The header is at the end of the file and lists every entry, so listing
//! is cheap. Data is usually packed into one solid LZMA block though, which
//! makes reading entry K as expensive as reading 1..K.

use crate::ArchiveEntry;
use crate::error::{ErrorKind, Result};
use crate::page::normalize_entry_name;
use exn::ResultExt;
use sevenz_rust::{Password, SevenZReader};
use std::io::{self, Read, Seek};
use std::ops::ControlFlow;
use tracing::instrument;

/// List every file entry from the archive header, without decoding data.
#[instrument(skip(reader))]
pub fn list_7z_entries<R: Read + Seek>(reader: R, len: u64) -> Result<Vec<ArchiveEntry>> {
    let archive = SevenZReader::new(reader, len, Password::empty()).or_raise(|| ErrorKind::InvalidData)?;
    let listed = archive
        .archive()
        .files
        .iter()
        .filter(|entry| !entry.is_directory())
        .map(|entry| ArchiveEntry { name: normalize_entry_name(entry.name()), size: entry.size() })
        .collect();
    Ok(listed)
}

/// Decode a 7z archive once, in storage order, with the same contract as
/// [`visit_tar_entries`](crate::visit_tar_entries).
#[instrument(skip(reader, visit))]
pub fn visit_7z_entries<R, F>(reader: R, len: u64, mut visit: F) -> Result<u64>
where
    R: Read + Seek,
    F: FnMut(&ArchiveEntry, &mut dyn Read) -> ControlFlow<()>,
{
    let mut archive = SevenZReader::new(reader, len, Password::empty()).or_raise(|| ErrorKind::InvalidData)?;
    let mut visited = 0;
    let mut skip_failed: Option<io::Error> = None;
    archive
        .for_each_entries(|entry, data| {
            if entry.is_directory() {
                return Ok(true);
            }
            let meta = ArchiveEntry { name: normalize_entry_name(entry.name()), size: entry.size() };
            visited += 1;
            if visit(&meta, &mut *data).is_break() {
                return Ok(false);
            }
            // Entries in a solid block share one decoder, so the rest of
            // this one has to be consumed before the next can start.
            if let Err(err) = io::copy(data, &mut io::sink()) {
                skip_failed = Some(err);
                return Ok(false);
            }
            Ok(true)
        })
        .or_raise(|| ErrorKind::InvalidData)?;
    if let Some(err) = skip_failed {
        return Err::<u64, io::Error>(err).or_raise(|| ErrorKind::InvalidData);
    }
    Ok(visited)
}
