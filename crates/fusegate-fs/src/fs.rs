//! The path-based filesystem contract a backing implementation fulfils.
//!
//! Every operation receives absolute paths resolved by the node table and
//! returns a positive errno on failure. All methods default to "function
//! not implemented", which the transport caches per session; implement
//! what the filesystem supports and leave the rest.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::SystemTime;

use bytes::Bytes;

/// Positive-errno result type used throughout the serve loop.
pub type FsResult<T> = Result<T, i32>;

/// Identity of the caller on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsContext {
    /// Effective uid.
    pub uid: u32,
    /// Effective gid.
    pub gid: u32,
    /// Calling process.
    pub pid: u32,
}

/// Stat data a backing filesystem reports.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    /// Size in bytes.
    pub size: u64,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Access time.
    pub atime: SystemTime,
    /// Modification time.
    pub mtime: SystemTime,
    /// Change time.
    pub ctime: SystemTime,
    /// Creation time.
    pub crtime: SystemTime,
    /// Backup time.
    pub bkuptime: SystemTime,
    /// Mode and type bits.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Device number for device nodes.
    pub rdev: u32,
    /// BSD flags.
    pub flags: u32,
}

impl Default for FileStat {
    fn default() -> Self {
        Self {
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            crtime: SystemTime::UNIX_EPOCH,
            bkuptime: SystemTime::UNIX_EPOCH,
            mode: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            flags: 0,
        }
    }
}

/// Filesystem-wide statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    /// Block size.
    pub block_size: u32,
    /// Total blocks.
    pub total_blocks: u64,
    /// Free blocks.
    pub free_blocks: u64,
    /// Blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total inodes.
    pub total_inodes: u64,
    /// Free inodes.
    pub free_inodes: u64,
    /// Maximum filename length.
    pub max_filename_length: u32,
}

/// One directory entry returned by [`PathFs::readdir`].
#[derive(Debug, Clone)]
pub struct ReaddirEntry {
    /// Entry name.
    pub name: OsString,
    /// Inode number, or zero to let the table assign one.
    pub ino: u64,
    /// File type (`DT_*`).
    pub typ: u32,
}

/// Open-file state threaded through I/O calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileInfo {
    /// `open(2)` flags.
    pub flags: u32,
    /// The handle the implementation returned from `open`/`create`.
    pub fh: u64,
}

/// New time values for `utimens` / the extended time setters.
#[derive(Debug, Clone, Copy)]
pub struct TimeSpec {
    /// Seconds since the epoch.
    pub sec: i64,
    /// Nanoseconds part.
    pub nsec: u32,
}

const ENOSYS: i32 = libc::ENOSYS;

/// A user-provided path-based filesystem.
///
/// Methods mirror the operations the transport can deliver. The serve loop
/// handles nodeid/path translation, hidden deletions, and reply framing;
/// implementations see only paths.
#[expect(unused_variables, reason = "default bodies ignore their arguments")]
pub trait PathFs: Send + Sync + 'static {
    /// Stat a path.
    fn getattr(&self, ctx: &FsContext, path: &Path) -> FsResult<FileStat> {
        Err(ENOSYS)
    }

    /// Read a symlink target.
    fn readlink(&self, ctx: &FsContext, path: &Path) -> FsResult<OsString> {
        Err(ENOSYS)
    }

    /// Create a file or device node.
    fn mknod(&self, ctx: &FsContext, path: &Path, mode: u32, rdev: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Create a directory.
    fn mkdir(&self, ctx: &FsContext, path: &Path, mode: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Remove a file.
    fn unlink(&self, ctx: &FsContext, path: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Remove a directory.
    fn rmdir(&self, ctx: &FsContext, path: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Create a symlink at `link` pointing to `target`.
    fn symlink(&self, ctx: &FsContext, target: &OsStr, link: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Move a path.
    fn rename(&self, ctx: &FsContext, from: &Path, to: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Atomically swap the contents of two paths.
    fn exchange(&self, ctx: &FsContext, a: &Path, b: &Path, options: u64) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Create a hard link at `link` to `target`.
    fn link(&self, ctx: &FsContext, target: &Path, link: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Change mode bits.
    fn chmod(&self, ctx: &FsContext, path: &Path, mode: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Change ownership.
    fn chown(&self, ctx: &FsContext, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Truncate to a new size.
    fn truncate(&self, ctx: &FsContext, path: &Path, size: u64) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Set access and modification times.
    fn utimens(
        &self,
        ctx: &FsContext,
        path: &Path,
        atime: Option<TimeSpec>,
        mtime: Option<TimeSpec>,
    ) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Set the creation time.
    fn setcrtime(&self, ctx: &FsContext, path: &Path, crtime: TimeSpec) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Set the backup time.
    fn setbkuptime(&self, ctx: &FsContext, path: &Path, bkuptime: TimeSpec) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Set the change time.
    fn setchgtime(&self, ctx: &FsContext, path: &Path, chgtime: TimeSpec) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Set BSD file flags.
    fn chflags(&self, ctx: &FsContext, path: &Path, flags: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Open a file; return an opaque handle for subsequent I/O.
    fn open(&self, ctx: &FsContext, path: &Path, flags: u32) -> FsResult<u64> {
        Err(ENOSYS)
    }

    /// Create and open a file.
    fn create(&self, ctx: &FsContext, path: &Path, mode: u32, flags: u32) -> FsResult<u64> {
        Err(ENOSYS)
    }

    /// Read up to `size` bytes at `offset`.
    fn read(
        &self,
        ctx: &FsContext,
        path: &Path,
        fi: &FileInfo,
        offset: u64,
        size: u32,
    ) -> FsResult<Bytes> {
        Err(ENOSYS)
    }

    /// Write bytes at `offset`; return how many were accepted.
    fn write(
        &self,
        ctx: &FsContext,
        path: &Path,
        fi: &FileInfo,
        offset: u64,
        data: &[u8],
    ) -> FsResult<u32> {
        Err(ENOSYS)
    }

    /// Filesystem statistics.
    fn statfs(&self, ctx: &FsContext, path: &Path) -> FsResult<FsStats> {
        Err(ENOSYS)
    }

    /// Flush at close time.
    fn flush(&self, ctx: &FsContext, path: &Path, fi: &FileInfo) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Drop a handle returned by [`open`](Self::open) / [`create`](Self::create).
    fn release(&self, ctx: &FsContext, path: &Path, fi: &FileInfo) -> FsResult<()> {
        Ok(())
    }

    /// Sync file state.
    fn fsync(&self, ctx: &FsContext, path: &Path, fi: &FileInfo, datasync: bool) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Set an extended attribute.
    fn setxattr(
        &self,
        ctx: &FsContext,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Get an extended attribute.
    fn getxattr(&self, ctx: &FsContext, path: &Path, name: &OsStr, position: u32) -> FsResult<Bytes> {
        Err(ENOSYS)
    }

    /// List extended attribute names.
    fn listxattr(&self, ctx: &FsContext, path: &Path) -> FsResult<Vec<OsString>> {
        Err(ENOSYS)
    }

    /// Remove an extended attribute.
    fn removexattr(&self, ctx: &FsContext, path: &Path, name: &OsStr) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Open a directory; return an opaque handle.
    fn opendir(&self, ctx: &FsContext, path: &Path) -> FsResult<u64> {
        Ok(0)
    }

    /// List a directory.
    fn readdir(&self, ctx: &FsContext, path: &Path, fi: &FileInfo) -> FsResult<Vec<ReaddirEntry>> {
        Err(ENOSYS)
    }

    /// Drop a directory handle.
    fn releasedir(&self, ctx: &FsContext, path: &Path, fi: &FileInfo) -> FsResult<()> {
        Ok(())
    }

    /// Sync directory state.
    fn fsyncdir(&self, ctx: &FsContext, path: &Path, fi: &FileInfo, datasync: bool) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Check access permissions.
    fn access(&self, ctx: &FsContext, path: &Path, mask: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Test for a conflicting lock. `None` means the range is free.
    #[expect(clippy::too_many_arguments, reason = "mirrors the lock request shape")]
    fn getlk(
        &self,
        ctx: &FsContext,
        path: &Path,
        fi: &FileInfo,
        owner: u64,
        start: u64,
        end: u64,
        typ: i32,
    ) -> FsResult<Option<(u64, u64, i32, u32)>> {
        Err(ENOSYS)
    }

    /// Apply or release a lock. `wait` distinguishes SETLKW.
    #[expect(clippy::too_many_arguments, reason = "mirrors the lock request shape")]
    fn setlk(
        &self,
        ctx: &FsContext,
        path: &Path,
        fi: &FileInfo,
        owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        wait: bool,
    ) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Map a logical block to a device block.
    fn bmap(&self, ctx: &FsContext, path: &Path, blocksize: u32, block: u64) -> FsResult<u64> {
        Err(ENOSYS)
    }

    /// Set the volume name.
    fn setvolname(&self, ctx: &FsContext, name: &OsStr) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Backup and creation times for a path.
    fn getxtimes(&self, ctx: &FsContext, path: &Path) -> FsResult<(SystemTime, SystemTime)> {
        Err(ENOSYS)
    }

    /// Called once after a successful INIT handshake.
    fn init(&self, ctx: &FsContext) {}

    /// Called when the session ends.
    fn destroy(&self) {}
}
