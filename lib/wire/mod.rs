//! Wire codec: fixed-layout request/response framing.
//!
//! Requests and replies share a header + payload framing. All integers are
//! little-endian fixed width and `len` includes the header. The codec is
//! pure data: constructors for each opcode's request payload, decoders for
//! each reply payload, no I/O and no state.
//!
//! Error values on the wire are unsigned; a received reply carries the
//! *negation* of the standard errno, which the device endpoint normalises
//! to a positive value before the dispatcher sees it.

/// Packed directory-entry records and their encoder/decoder.
pub mod dirent;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::ProtocolViolation;

/// Protocol major version spoken by the transport.
pub const KERNEL_VERSION: u32 = 7;
/// Protocol minor version spoken by the transport.
pub const KERNEL_MINOR_VERSION: u32 = 19;
/// Oldest server minor revision the transport will talk to.
pub const MIN_SUPPORTED_MINOR: u32 = 8;

/// The fixed nodeid of the filesystem root.
pub const ROOT_ID: u64 = 1;
/// Sentinel nodeid that never names a real inode.
pub const UNKNOWN_INO: u64 = 0xffff_ffff;
/// Longest name accepted in a directory entry.
pub const MAX_NAME: usize = 255;

/// Default maximum WRITE payload negotiated when the server does not lower it.
pub const DEFAULT_MAX_WRITE: u32 = 1 << 20;
/// Default filesystem block size.
pub const DEFAULT_BLOCKSIZE: u32 = 4096;
/// Default transfer unit for READ/READDIR.
pub const DEFAULT_IOSIZE: u32 = 1 << 16;

/// Operation selector carried in every request header.
///
/// Numeric values are wire ABI; `SetattrX` occupies the slot left unassigned
/// between `Symlink` and `Mknod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Resolve a name within a directory to an inode.
    Lookup = 1,
    /// Drop lookup references on an inode. Carries no reply.
    Forget = 2,
    /// Fetch attributes.
    Getattr = 3,
    /// Update attributes.
    Setattr = 4,
    /// Read a symlink target.
    Readlink = 5,
    /// Create a symlink.
    Symlink = 6,
    /// Update attributes including backup/creation times.
    SetattrX = 7,
    /// Create a device node or regular file.
    Mknod = 8,
    /// Create a directory.
    Mkdir = 9,
    /// Remove a name.
    Unlink = 10,
    /// Remove a directory.
    Rmdir = 11,
    /// Move a name.
    Rename = 12,
    /// Create a hard link.
    Link = 13,
    /// Open a file.
    Open = 14,
    /// Read file data.
    Read = 15,
    /// Write file data.
    Write = 16,
    /// Filesystem statistics.
    Statfs = 17,
    /// Drop a file handle.
    Release = 18,
    /// Flush dirty file state to stable storage.
    Fsync = 20,
    /// Set an extended attribute.
    Setxattr = 21,
    /// Get an extended attribute.
    Getxattr = 22,
    /// List extended attribute names.
    Listxattr = 23,
    /// Remove an extended attribute.
    Removexattr = 24,
    /// Flush at close time.
    Flush = 25,
    /// Session handshake.
    Init = 26,
    /// Open a directory.
    Opendir = 27,
    /// Read directory entries.
    Readdir = 28,
    /// Drop a directory handle.
    Releasedir = 29,
    /// Flush directory state.
    Fsyncdir = 30,
    /// Test for a POSIX lock.
    Getlk = 31,
    /// Acquire or release a POSIX lock (non-blocking).
    Setlk = 32,
    /// Acquire a POSIX lock, waiting.
    Setlkw = 33,
    /// Check access permissions.
    Access = 34,
    /// Atomically create and open a file.
    Create = 35,
    /// Cancel an in-flight request.
    Interrupt = 36,
    /// Map a file block to a device block.
    Bmap = 37,
    /// Set the volume name.
    Setvolname = 61,
    /// Fetch backup and creation times.
    Getxtimes = 62,
    /// Atomically swap two paths.
    Exchange = 63,
}

impl Opcode {
    /// Decode a wire opcode number.
    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Lookup,
            2 => Self::Forget,
            3 => Self::Getattr,
            4 => Self::Setattr,
            5 => Self::Readlink,
            6 => Self::Symlink,
            7 => Self::SetattrX,
            8 => Self::Mknod,
            9 => Self::Mkdir,
            10 => Self::Unlink,
            11 => Self::Rmdir,
            12 => Self::Rename,
            13 => Self::Link,
            14 => Self::Open,
            15 => Self::Read,
            16 => Self::Write,
            17 => Self::Statfs,
            18 => Self::Release,
            20 => Self::Fsync,
            21 => Self::Setxattr,
            22 => Self::Getxattr,
            23 => Self::Listxattr,
            24 => Self::Removexattr,
            25 => Self::Flush,
            26 => Self::Init,
            27 => Self::Opendir,
            28 => Self::Readdir,
            29 => Self::Releasedir,
            30 => Self::Fsyncdir,
            31 => Self::Getlk,
            32 => Self::Setlk,
            33 => Self::Setlkw,
            34 => Self::Access,
            35 => Self::Create,
            36 => Self::Interrupt,
            37 => Self::Bmap,
            61 => Self::Setvolname,
            62 => Self::Getxtimes,
            63 => Self::Exchange,
            _ => return None,
        })
    }

    /// Bit index in the session's not-implemented mask, or `None` for
    /// opcodes that never participate in "unsupported" caching.
    #[must_use]
    pub fn noimpl_bit(self) -> Option<u32> {
        match self {
            Self::Init | Self::Forget | Self::Interrupt => None,
            op => Some(op as u32),
        }
    }
}

/// Identity of the caller a request is issued on behalf of, stamped into
/// the request header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caller {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
    /// Process id.
    pub pid: u32,
}

/// Fixed header preceding every request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InHeader {
    /// Total frame length, header included.
    pub len: u32,
    /// Wire value of the [`Opcode`].
    pub opcode: u32,
    /// Per-session request identifier; nonzero.
    pub unique: u64,
    /// Inode the operation targets; zero for session-scoped requests.
    pub nodeid: u64,
    /// Caller uid.
    pub uid: u32,
    /// Caller gid.
    pub gid: u32,
    /// Caller pid.
    pub pid: u32,
    /// Reserved.
    pub padding: u32,
}

impl InHeader {
    /// Size of the request header on the wire.
    pub const SIZE: usize = size_of::<Self>();
}

/// Fixed header preceding every reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OutHeader {
    /// Total frame length, header included.
    pub len: u32,
    /// Zero on success; otherwise the *negated* errno.
    pub error: i32,
    /// Identifier of the request being answered.
    pub unique: u64,
}

impl OutHeader {
    /// Size of the reply header on the wire.
    pub const SIZE: usize = size_of::<Self>();

    /// Header for a successful reply carrying `body_len` payload bytes.
    #[must_use]
    pub fn success(unique: u64, body_len: usize) -> Self {
        Self {
            len: frame_len(body_len),
            error: 0,
            unique,
        }
    }

    /// Header for an error reply. `errno` is positive; the wire carries its
    /// negation and no body.
    #[must_use]
    pub fn error(unique: u64, errno: i32) -> Self {
        Self {
            len: frame_len(0),
            error: -errno,
            unique,
        }
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "frame lengths are bounded by the negotiated max_write"
)]
fn frame_len(body_len: usize) -> u32 {
    (OutHeader::SIZE + body_len) as u32
}

/// Build a framed request: header, payload, and optionally a trailing bulk
/// data buffer accounted for in `len` but kept external (the dispatcher
/// never copies WRITE data).
#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    reason = "frame lengths are bounded by the negotiated max_write"
)]
pub fn frame_request(
    opcode: Opcode,
    unique: u64,
    nodeid: u64,
    caller: Caller,
    payload: &[u8],
    data_len: usize,
) -> Bytes {
    let header = InHeader {
        len: (InHeader::SIZE + payload.len() + data_len) as u32,
        opcode: opcode as u32,
        unique,
        nodeid,
        uid: caller.uid,
        gid: caller.gid,
        pid: caller.pid,
        padding: 0,
    };
    let mut buf = BytesMut::with_capacity(InHeader::SIZE + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a framed success reply from a payload struct.
#[must_use]
pub fn frame_reply<T: IntoBytes + Immutable>(unique: u64, payload: &T) -> Bytes {
    frame_reply_bytes(unique, payload.as_bytes())
}

/// Build a framed success reply from raw payload bytes.
#[must_use]
pub fn frame_reply_bytes(unique: u64, body: &[u8]) -> Bytes {
    let header = OutHeader::success(unique, body.len());
    let mut buf = BytesMut::with_capacity(OutHeader::SIZE + body.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// Build a framed error reply. `errno` is positive.
#[must_use]
pub fn frame_error(unique: u64, errno: i32) -> Bytes {
    Bytes::copy_from_slice(OutHeader::error(unique, errno).as_bytes())
}

/// Split a request frame into its header and body.
pub fn split_request(frame: &[u8]) -> Result<(InHeader, &[u8]), ProtocolViolation> {
    let (header, body) =
        InHeader::read_from_prefix(frame).map_err(|_| ProtocolViolation::HeaderTooShort)?;
    if header.len as usize != frame.len() {
        return Err(ProtocolViolation::LengthMismatch);
    }
    Ok((header, body))
}

/// Decode a payload struct from the front of a message body.
pub fn payload<T: FromBytes>(body: &[u8]) -> Result<(T, &[u8]), ProtocolViolation> {
    T::read_from_prefix(body).map_err(|_| ProtocolViolation::BodyTooShort)
}

/// Extract one NUL-terminated name from a message body, returning the name
/// and the remainder past the terminator.
pub fn split_name(body: &[u8]) -> Result<(&[u8], &[u8]), ProtocolViolation> {
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolViolation::BodyTooShort)?;
    Ok((&body[..nul], &body[nul + 1..]))
}

bitflags! {
    /// Capability bits exchanged during INIT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u32 {
        /// Asynchronous read requests.
        const ASYNC_READ       = 1 << 0;
        /// Remote POSIX locking.
        const POSIX_LOCKS      = 1 << 1;
        /// Server handles `O_TRUNC` itself.
        const ATOMIC_O_TRUNC   = 1 << 3;
        /// Writes larger than one page.
        const BIG_WRITES       = 1 << 5;
        /// Case-insensitive name lookup in the inode table.
        const CASE_INSENSITIVE = 1 << 29;
        /// Server accepts SETVOLNAME.
        const VOL_RENAME       = 1 << 30;
        /// Backup and creation times are exposed in attributes.
        const XTIMES           = 1 << 31;
    }
}

bitflags! {
    /// Validity mask for [`SetattrIn`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetattrValid: u32 {
        /// `mode` is set.
        const MODE      = 1 << 0;
        /// `uid` is set.
        const UID       = 1 << 1;
        /// `gid` is set.
        const GID       = 1 << 2;
        /// `size` is set.
        const SIZE      = 1 << 3;
        /// `atime` is set.
        const ATIME     = 1 << 4;
        /// `mtime` is set.
        const MTIME     = 1 << 5;
        /// `fh` identifies an open handle to apply the change through.
        const FH        = 1 << 6;
        /// Set atime to "now".
        const ATIME_NOW = 1 << 7;
        /// Set mtime to "now".
        const MTIME_NOW = 1 << 8;
        /// `crtime` is set.
        const CRTIME    = 1 << 28;
        /// `chgtime` is set.
        const CHGTIME   = 1 << 29;
        /// `bkuptime` is set.
        const BKUPTIME  = 1 << 30;
        /// `flags` is set.
        const FLAGS     = 1 << 31;
    }
}

/// Inode attributes as carried on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Attr {
    /// Inode number.
    pub ino: u64,
    /// File size in bytes.
    pub size: u64,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Access time, seconds.
    pub atime: i64,
    /// Modification time, seconds.
    pub mtime: i64,
    /// Change time, seconds.
    pub ctime: i64,
    /// Creation time, seconds.
    pub crtime: i64,
    /// Access time, nanoseconds part.
    pub atimensec: u32,
    /// Modification time, nanoseconds part.
    pub mtimensec: u32,
    /// Change time, nanoseconds part.
    pub ctimensec: u32,
    /// Creation time, nanoseconds part.
    pub crtimensec: u32,
    /// File mode and type bits.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Device number for device nodes.
    pub rdev: u32,
    /// BSD file flags.
    pub flags: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Reserved.
    pub padding: u32,
}

/// LOOKUP / CREATE reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EntryOut {
    /// Inode number assigned to the entry.
    pub nodeid: u64,
    /// Generation paired with the nodeid.
    pub generation: u64,
    /// Seconds the name may be cached.
    pub entry_valid: u64,
    /// Seconds the attributes may be cached.
    pub attr_valid: u64,
    /// Nanoseconds part of `entry_valid`.
    pub entry_valid_nsec: u32,
    /// Nanoseconds part of `attr_valid`.
    pub attr_valid_nsec: u32,
    /// Attributes of the entry.
    pub attr: Attr,
}

/// GETATTR / SETATTR reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AttrOut {
    /// Seconds the attributes may be cached.
    pub attr_valid: u64,
    /// Nanoseconds part of `attr_valid`.
    pub attr_valid_nsec: u32,
    /// Reserved.
    pub dummy: u32,
    /// The attributes.
    pub attr: Attr,
}

/// GETXTIMES reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetxtimesOut {
    /// Backup time, seconds.
    pub bkuptime: u64,
    /// Creation time, seconds.
    pub crtime: u64,
    /// Backup time, nanoseconds part.
    pub bkuptimensec: u32,
    /// Creation time, nanoseconds part.
    pub crtimensec: u32,
}

/// FORGET request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ForgetIn {
    /// Number of lookup references to drop.
    pub nlookup: u64,
}

/// GETATTR request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetattrIn {
    /// Request flags; bit 0 means `fh` is valid.
    pub getattr_flags: u32,
    /// Reserved.
    pub dummy: u32,
    /// Open handle the request applies through, when flagged.
    pub fh: u64,
}

/// SETATTR / SETATTR_X request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SetattrIn {
    /// [`SetattrValid`] bits.
    pub valid: u32,
    /// Reserved.
    pub padding: u32,
    /// Open handle, when `FH` is set.
    pub fh: u64,
    /// New size, when `SIZE` is set.
    pub size: u64,
    /// Lock owner, when `LOCKOWNER` is set.
    pub lock_owner: u64,
    /// New atime seconds.
    pub atime: i64,
    /// New mtime seconds.
    pub mtime: i64,
    /// New ctime seconds.
    pub ctime: i64,
    /// New atime nanoseconds.
    pub atimensec: u32,
    /// New mtime nanoseconds.
    pub mtimensec: u32,
    /// New ctime nanoseconds.
    pub ctimensec: u32,
    /// New mode.
    pub mode: u32,
    /// New owner uid.
    pub uid: u32,
    /// New owner gid.
    pub gid: u32,
    /// New backup time seconds.
    pub bkuptime: i64,
    /// New change time seconds.
    pub chgtime: i64,
    /// New creation time seconds.
    pub crtime: i64,
    /// New backup time nanoseconds.
    pub bkuptimensec: u32,
    /// New change time nanoseconds.
    pub chgtimensec: u32,
    /// New creation time nanoseconds.
    pub crtimensec: u32,
    /// New BSD flags.
    pub flags: u32,
}

/// MKNOD request payload; the name follows NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MknodIn {
    /// File mode and type.
    pub mode: u32,
    /// Device number for device nodes.
    pub rdev: u32,
}

/// MKDIR request payload; the name follows NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MkdirIn {
    /// Directory mode.
    pub mode: u32,
    /// Reserved.
    pub padding: u32,
}

/// RENAME request payload; old and new names follow NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RenameIn {
    /// Destination directory nodeid.
    pub newdir: u64,
}

/// EXCHANGE request payload; both names follow NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ExchangeIn {
    /// Directory of the first path.
    pub olddir: u64,
    /// Directory of the second path.
    pub newdir: u64,
    /// Exchange options, passed through to the server.
    pub options: u64,
}

/// LINK request payload; the new name follows NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LinkIn {
    /// Existing inode to link to.
    pub oldnodeid: u64,
}

/// OPEN / OPENDIR request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OpenIn {
    /// `open(2)` flags.
    pub flags: u32,
    /// Reserved.
    pub unused: u32,
}

/// OPEN / OPENDIR / CREATE reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OpenOut {
    /// Server-chosen opaque file handle.
    pub fh: u64,
    /// Open flags returned by the server.
    pub open_flags: u32,
    /// Reserved.
    pub padding: u32,
}

/// CREATE request payload; the name follows NUL-terminated.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CreateIn {
    /// `open(2)` flags.
    pub flags: u32,
    /// File mode.
    pub mode: u32,
}

/// RELEASE / RELEASEDIR request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReleaseIn {
    /// Handle being dropped.
    pub fh: u64,
    /// Flags the handle was opened with.
    pub flags: u32,
    /// Release-specific flags.
    pub release_flags: u32,
    /// Lock owner whose locks die with the handle.
    pub lock_owner: u64,
}

/// FLUSH request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FlushIn {
    /// Handle being flushed.
    pub fh: u64,
    /// Reserved.
    pub unused: u32,
    /// Reserved.
    pub padding: u32,
    /// Lock owner whose locks are released.
    pub lock_owner: u64,
}

/// READ / READDIR request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadIn {
    /// Open handle.
    pub fh: u64,
    /// Byte (READ) or cookie (READDIR) offset.
    pub offset: u64,
    /// Maximum bytes to return.
    pub size: u32,
    /// Reserved.
    pub padding: u32,
}

/// WRITE request payload; the data follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WriteIn {
    /// Open handle.
    pub fh: u64,
    /// Byte offset.
    pub offset: u64,
    /// Length of the trailing data.
    pub size: u32,
    /// Write-specific flags.
    pub write_flags: u32,
}

/// WRITE reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WriteOut {
    /// Bytes accepted by the server.
    pub size: u32,
    /// Reserved.
    pub padding: u32,
}

/// STATFS reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatfsOut {
    /// Total data blocks.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Maximum name length.
    pub namelen: u32,
    /// Fundamental block size.
    pub frsize: u32,
    /// Reserved.
    pub padding: u32,
    /// Reserved.
    pub spare: [u32; 6],
}

/// FSYNC / FSYNCDIR request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FsyncIn {
    /// Open handle.
    pub fh: u64,
    /// Bit 0: only sync user data, not metadata.
    pub fsync_flags: u32,
    /// Reserved.
    pub padding: u32,
}

/// SETXATTR request payload; name (NUL-terminated) and value follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SetxattrIn {
    /// Value length.
    pub size: u32,
    /// `setxattr(2)` flags.
    pub flags: u32,
    /// Offset within the attribute (resource forks).
    pub position: u32,
    /// Reserved.
    pub padding: u32,
}

/// GETXATTR / LISTXATTR request payload; for GETXATTR the name follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetxattrIn {
    /// Caller's buffer size; zero asks for the required size.
    pub size: u32,
    /// Reserved.
    pub padding: u32,
    /// Offset within the attribute (resource forks).
    pub position: u32,
    /// Reserved.
    pub padding2: u32,
}

/// GETXATTR / LISTXATTR size-probe reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetxattrOut {
    /// Required buffer size.
    pub size: u32,
    /// Reserved.
    pub padding: u32,
}

/// A POSIX byte-range lock.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FileLock {
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range.
    pub end: u64,
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub typ: i32,
    /// Owning process.
    pub pid: u32,
}

/// GETLK / SETLK / SETLKW request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LkIn {
    /// Open handle.
    pub fh: u64,
    /// Lock owner token.
    pub owner: u64,
    /// The lock being queried or applied.
    pub lk: FileLock,
}

/// GETLK reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LkOut {
    /// The conflicting lock, or `F_UNLCK` if none.
    pub lk: FileLock,
}

/// ACCESS request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AccessIn {
    /// `access(2)` mask.
    pub mask: u32,
    /// Reserved.
    pub padding: u32,
}

/// INIT request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InitIn {
    /// Transport major version.
    pub major: u32,
    /// Transport minor version.
    pub minor: u32,
    /// Largest readahead the transport will issue.
    pub max_readahead: u32,
    /// Requested [`SessionFlags`].
    pub flags: u32,
}

/// INIT reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InitOut {
    /// Server major version.
    pub major: u32,
    /// Server minor version.
    pub minor: u32,
    /// Readahead granted.
    pub max_readahead: u32,
    /// Granted [`SessionFlags`].
    pub flags: u32,
    /// Reserved.
    pub unused: u32,
    /// Largest WRITE payload the server accepts.
    pub max_write: u32,
}

/// INTERRUPT request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InterruptIn {
    /// Unique id of the request to cancel.
    pub unique: u64,
}

/// BMAP request payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BmapIn {
    /// Logical block to map.
    pub block: u64,
    /// Block size the caller is using.
    pub blocksize: u32,
    /// Reserved.
    pub padding: u32,
}

/// BMAP reply payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BmapOut {
    /// Physical block.
    pub block: u64,
}
