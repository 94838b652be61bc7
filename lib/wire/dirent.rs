//! Packed directory-entry stream.
//!
//! READDIR replies carry a sequence of `{ino, off, namelen, type, name[]}`
//! records, each padded to an 8-byte boundary. The stream is terminated by
//! running out of full records; a trailing short record is a terminator, not
//! an error.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::MAX_NAME;

/// Fixed prefix of one directory record; the name follows, padded to 8.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DirentHeader {
    /// Inode number of the entry.
    pub ino: u64,
    /// Opaque cookie at which the *next* READDIR should resume.
    pub off: u64,
    /// Length of the name in bytes.
    pub namelen: u32,
    /// File type (`DT_*` value).
    pub typ: u32,
}

/// Size of the fixed record prefix.
pub const NAME_OFFSET: usize = size_of::<DirentHeader>();

const fn padded(namelen: usize) -> usize {
    (NAME_OFFSET + namelen).div_ceil(8) * 8
}

/// A malformed record in a directory stream.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DirentError {
    /// A record declared a zero-length name.
    #[error("directory record with empty name")]
    EmptyName,
    /// A record declared a name longer than [`MAX_NAME`].
    #[error("directory record name of {0} bytes exceeds the maximum")]
    NameTooLong(usize),
}

impl From<DirentError> for i32 {
    fn from(e: DirentError) -> Self {
        match e {
            DirentError::EmptyName => libc::EINVAL,
            DirentError::NameTooLong(_) => libc::EIO,
        }
    }
}

/// One decoded directory entry borrowing its name from the reply buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentRef<'a> {
    /// Inode number.
    pub ino: u64,
    /// Resume cookie for the next call.
    pub off: u64,
    /// File type (`DT_*`).
    pub typ: u32,
    /// Entry name.
    pub name: &'a [u8],
}

/// Iterator over a packed directory stream.
///
/// Yields `Ok` entries until the buffer runs out of full records. Malformed
/// records yield one `Err` and fuse the iterator.
#[derive(Debug)]
pub struct DirentIter<'a> {
    rest: &'a [u8],
    fused: bool,
}

impl<'a> DirentIter<'a> {
    /// Iterate the records in `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            rest: buf,
            fused: false,
        }
    }
}

impl<'a> Iterator for DirentIter<'a> {
    type Item = Result<DirentRef<'a>, DirentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused || self.rest.len() < NAME_OFFSET {
            return None;
        }
        let Ok((header, _)) = DirentHeader::read_from_prefix(self.rest) else {
            return None;
        };
        let namelen = header.namelen as usize;
        if namelen == 0 {
            self.fused = true;
            return Some(Err(DirentError::EmptyName));
        }
        if namelen > MAX_NAME {
            self.fused = true;
            return Some(Err(DirentError::NameTooLong(namelen)));
        }
        let reclen = padded(namelen);
        if self.rest.len() < NAME_OFFSET + namelen {
            // Short record: terminator.
            return None;
        }
        let name = &self.rest[NAME_OFFSET..NAME_OFFSET + namelen];
        self.rest = if self.rest.len() < reclen {
            &[]
        } else {
            &self.rest[reclen..]
        };
        Some(Ok(DirentRef {
            ino: header.ino,
            off: header.off,
            typ: header.typ,
            name,
        }))
    }
}

/// Builder for a packed directory stream bounded by the caller's buffer size.
#[derive(Debug)]
pub struct DirentBuf {
    buf: BytesMut,
    max: usize,
}

impl DirentBuf {
    /// A buffer that will not grow past `max` bytes.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max.min(1 << 16)),
            max,
        }
    }

    /// Append one record. Returns `false` without appending when the record
    /// would overflow the buffer, signalling the caller to stop.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "namelen is checked against MAX_NAME, which fits in u32"
    )]
    pub fn push(&mut self, ino: u64, off: u64, typ: u32, name: &[u8]) -> bool {
        let namelen = name.len().min(MAX_NAME);
        let reclen = padded(namelen);
        if self.buf.len() + reclen > self.max {
            return false;
        }
        let header = DirentHeader {
            ino,
            off,
            namelen: namelen as u32,
            typ,
        };
        self.buf.put_slice(header.as_bytes());
        self.buf.put_slice(&name[..namelen]);
        self.buf.put_bytes(0, reclen - NAME_OFFSET - namelen);
        true
    }

    /// Bytes appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and take the packed stream.
    #[must_use]
    pub fn freeze(self) -> bytes::Bytes {
        self.buf.freeze()
    }
}
