//! READDIR reply decoding into host directory entries.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use crate::error::TransportError;
use crate::wire::dirent::DirentIter;

/// One decoded, host-shaped directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number.
    pub ino: u64,
    /// Cookie at which the next READDIR resumes.
    pub off: u64,
    /// File type (`DT_*`).
    pub typ: u32,
    /// Entry name.
    pub name: OsString,
}

fn is_apple_double(name: &[u8]) -> bool {
    name == b".DS_Store" || name.starts_with(b"._")
}

/// Decode a packed READDIR reply.
///
/// `filter_apple_double` drops `.DS_Store` and `._*` names. A record with
/// an empty name is a protocol error; a name past the maximum is a fatal
/// I/O error for this call. A trailing short record terminates the stream.
pub fn decode_readdir(
    buf: &[u8],
    filter_apple_double: bool,
) -> Result<Vec<DirEntry>, TransportError> {
    let mut entries = Vec::new();
    for record in DirentIter::new(buf) {
        let record = record.map_err(|e| TransportError::Errno(e.into()))?;
        if filter_apple_double && is_apple_double(record.name) {
            continue;
        }
        entries.push(DirEntry {
            ino: record.ino,
            off: record.off,
            typ: record.typ,
            name: OsString::from_vec(record.name.to_vec()),
        });
    }
    Ok(entries)
}
