//! Content bundles
//!
//! Bulk content travels as a zip archive with one entry per element key.

use crate::error::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Upper bound on the buffer reserved from an entry's declared size
const MAX_PREALLOC: usize = 1 << 20;

/// Pack `key -> payload` pairs into a bundle
pub fn pack<'a, I>(entries: I) -> Result<Bytes>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (key, payload) in entries {
        writer.start_file(key, options)?;
        writer.write_all(payload)?;
    }

    let cursor = writer.finish()?;
    Ok(Bytes::from(cursor.into_inner()))
}

/// Unpack a bundle into `key -> payload`
pub fn unpack(data: &[u8]) -> Result<HashMap<String, Bytes>> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut entries = HashMap::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if !file.is_file() {
            continue;
        }
        let name = file.name().to_string();
        let mut contents = Vec::with_capacity(prealloc(file.size()));
        file.read_to_end(&mut contents)?;
        entries.insert(name, Bytes::from(contents));
    }

    Ok(entries)
}

/// Buffer to reserve for an entry; the declared size is not trusted
fn prealloc(declared: u64) -> usize {
    usize::try_from(declared).unwrap_or(usize::MAX).min(MAX_PREALLOC)
}
