//! Front-to-back reads of solid (tar family) containers.
//!
//! There is no index to seek with: the only way to reach entry K is to
//! decode entries 1..K-1. Callers get a single pass and decide per entry
//! whether to keep going.

use crate::error::{ErrorKind, Result};
use crate::page::normalize_entry_name;
use crate::{ArchiveEntry, Compression};
use exn::ResultExt;
use std::io::{Read, Seek};
use std::ops::ControlFlow;
use tracing::instrument;

/// Decode a tarball once, handing every regular file entry to `visit`
/// along with a reader over its contents.
///
/// The visitor may read as much or as little of the entry as it wants; the
/// remainder is skipped. Returning [`ControlFlow::Break`] stops the walk
/// early (cancellation). Returns the number of entries visited.
///
/// A corrupt header or truncated stream aborts the whole walk, since nothing
/// after it can be located.
#[instrument(skip(reader, visit))]
pub fn visit_tar_entries<R, F>(reader: R, compression: Compression, mut visit: F) -> Result<u64>
where
    R: Read,
    F: FnMut(&ArchiveEntry, &mut dyn Read) -> ControlFlow<()>,
{
    let decoded = compression.wrap_reader(reader)?;
    let mut archive = tar::Archive::new(decoded);
    let entries = archive.entries().or_raise(|| ErrorKind::InvalidData)?;
    let mut visited = 0;
    for entry in entries {
        let mut entry = entry.or_raise(|| ErrorKind::InvalidData)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = {
            let path = entry.path().or_raise(|| ErrorKind::InvalidData)?;
            normalize_entry_name(&path.to_string_lossy())
        };
        let meta = ArchiveEntry { name, size: entry.size() };
        visited += 1;
        if visit(&meta, &mut entry).is_break() {
            break;
        }
    }
    Ok(visited)
}

/// List every regular file in a tarball. This costs a full decode.
pub fn list_tar_entries<R: Read>(reader: R, compression: Compression) -> Result<Vec<ArchiveEntry>> {
    let mut listed = Vec::new();
    visit_tar_entries(reader, compression, |entry, _| {
        listed.push(entry.clone());
        ControlFlow::Continue(())
    })?;
    Ok(listed)
}

/// List an uncompressed tarball by hopping from header to header.
///
/// Only the 512 byte headers are read, entry data is seeked over.
#[instrument(skip(reader))]
pub fn list_plain_tar_entries<R: Read + Seek>(reader: R) -> Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(reader);
    let mut listed = Vec::new();
    for entry in archive.entries_with_seek().or_raise(|| ErrorKind::InvalidData)? {
        let entry = entry.or_raise(|| ErrorKind::InvalidData)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().or_raise(|| ErrorKind::InvalidData)?;
        listed.push(ArchiveEntry { name: normalize_entry_name(&path.to_string_lossy()), size: entry.size() });
    }
    Ok(listed)
}
