use std::io::{Cursor, Read};
use thiserror::Error;
use zip::ZipArchive;

/// Error possibly returned by [extract].
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("cannot open candle archive")]
    Archive(#[from] zip::result::ZipError),

    #[error("cannot read candle archive entry")]
    Entry(#[from] std::io::Error),
}

/// Turn one year's candle archive into a single loadable CSV.
///
/// All archive entries are concatenated, every ASCII occurrence of the instrument UID is
/// substituted with the ASCII decimal id, and the trailing delimiter the archive producer
/// emits before each newline is stripped. Pure and CPU-bound; callers run it off the I/O
/// executor.
pub fn extract(zip: &[u8], uid: &str, id: i32) -> Result<Vec<u8>, ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(zip))?;

    let mut csv = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        entry.read_to_end(&mut csv)?;
    }

    let csv = replace(&csv, uid.as_bytes(), id.to_string().as_bytes());
    let csv = replace(&csv, b";\n", b"\n");

    Ok(csv)
}

fn replace(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut replaced = Vec::with_capacity(haystack.len());
    let mut rest = haystack;

    while let Some(start) = find(rest, needle) {
        replaced.extend_from_slice(&rest[..start]);
        replaced.extend_from_slice(replacement);
        rest = &rest[start + needle.len()..];
    }
    replaced.extend_from_slice(rest);

    replaced
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
