//! Small in-memory archives for tests, here and in dependent crates.
//!
//! Enabled by the `test-util` feature. Everything panics on failure: a test
//! with a broken fixture should not get as far as its assertions.

use crate::Compression;
use sevenz_rust::{SevenZArchiveEntry, SevenZWriter};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

/// A plain (uncompressed) tarball, entries in the order given.
pub fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// A zip with stored (uncompressed) entries.
pub fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A 7z archive. The writer works on real files, so the entries are staged
/// in a temp directory first.
pub fn build_7z(files: &[(&str, &[u8])]) -> Vec<u8> {
    let staging = tempfile::tempdir().unwrap();
    let archive = staging.path().join("fixture.7z");
    let mut writer = SevenZWriter::create(&archive).unwrap();
    for (index, (name, data)) in files.iter().enumerate() {
        let source = staging.path().join(index.to_string());
        std::fs::write(&source, data).unwrap();
        let entry = SevenZArchiveEntry::from_path(&source, name.to_string());
        writer.push_archive_entry(entry, Some(std::fs::File::open(&source).unwrap())).unwrap();
    }
    writer.finish().unwrap();
    std::fs::read(&archive).unwrap()
}

/// Run `input` through the encoder for `format`.
pub fn compress(format: Compression, input: &[u8]) -> Vec<u8> {
    let mut output = Vec::new();
    match format {
        Compression::None => output.extend_from_slice(input),
        Compression::Bzip2 => {
            let mut encoder = bzip2::write::BzEncoder::new(&mut output, bzip2::Compression::fast());
            encoder.write_all(input).unwrap();
            encoder.finish().unwrap();
        },
        Compression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(&mut output, flate2::Compression::fast());
            encoder.write_all(input).unwrap();
            encoder.finish().unwrap();
        },
        #[cfg(feature = "xz")]
        Compression::Xz => {
            let mut encoder = xz2::write::XzEncoder::new(&mut output, 1);
            encoder.write_all(input).unwrap();
            encoder.finish().unwrap();
        },
        #[cfg(feature = "zstd")]
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(&mut output, 1).unwrap();
            encoder.write_all(input).unwrap();
            encoder.finish().unwrap();
        },
    }
    output
}
