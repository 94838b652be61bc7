//! The session loop: reads framed requests off a channel, dispatches them
//! to a [`PathFs`], and writes framed replies.
//!
//! One loop per session. Requests are handled in arrival order; FORGET and
//! INTERRUPT produce no reply. An INTERRUPT whose target has not arrived
//! yet is remembered, and the target is answered `EINTR` without touching
//! the filesystem when it shows up.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fusegate::error::ProtocolViolation;
use fusegate::wire::{
    self, AccessIn, Attr, AttrOut, BmapIn, BmapOut, CreateIn, EntryOut, ExchangeIn, FileLock,
    FlushIn, ForgetIn, FsyncIn, GetattrIn, GetxattrIn, GetxattrOut, GetxtimesOut, InitIn, InitOut,
    InterruptIn, LinkIn, LkIn, LkOut, MkdirIn, MknodIn, Opcode, OpenIn, OpenOut, ReadIn,
    ReleaseIn, RenameIn, SetattrIn, SetattrValid, SetxattrIn, SessionFlags, StatfsOut, WriteIn,
    WriteOut, dirent::DirentBuf,
};
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::fs::{FileInfo, FileStat, FsContext, PathFs, TimeSpec};
use crate::hidden::hide_node;
use crate::nodes::{LockRange, NodeTable};

/// Bound on remembered not-yet-seen interrupts.
const INTERRUPT_BACKLOG: usize = 4096;

/// A channel the serve loop pulls requests from and pushes replies into.
pub trait Channel {
    /// Receive one framed request.
    fn receive(&self) -> Result<Bytes, ChannelError>;
    /// Send one framed reply.
    fn send(&self, frame: &[u8]) -> Result<(), ChannelError>;
}

/// Channel-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Transient condition; call again.
    Retry,
    /// The peer is gone; the session is over.
    Disconnected,
    /// Hard transport failure.
    Io(i32),
}

/// Why [`FsServer::run`] stopped abnormally.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ServeError {
    /// The channel failed with an errno.
    #[error("channel failure: errno {0}")]
    Channel(i32),
}

/// Server-side session tunables.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Skip the hidden-rename mechanism; always unlink immediately.
    pub hard_remove: bool,
    /// Capability flags this server is willing to grant.
    pub flags: SessionFlags,
    /// Largest WRITE payload accepted.
    pub max_write: u32,
    /// Validity the server grants on entries and attributes.
    pub attr_ttl: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            hard_remove: false,
            flags: SessionFlags::ASYNC_READ | SessionFlags::ATOMIC_O_TRUNC,
            max_write: wire::DEFAULT_MAX_WRITE,
            attr_ttl: Duration::from_secs(1),
        }
    }
}

/// The user-space session driver wrapping a [`PathFs`].
pub struct FsServer<F: PathFs> {
    fs: F,
    nodes: NodeTable,
    config: ServeConfig,
    interrupted: Mutex<FxHashSet<u64>>,
    inited: AtomicBool,
}

type HandlerResult = Result<Bytes, i32>;

impl<F: PathFs> FsServer<F> {
    /// Wrap a filesystem for serving.
    #[must_use]
    pub fn new(fs: F, config: ServeConfig) -> Self {
        let case_insensitive = config.flags.contains(SessionFlags::CASE_INSENSITIVE);
        Self {
            fs,
            nodes: NodeTable::new(case_insensitive),
            config,
            interrupted: Mutex::new(FxHashSet::default()),
            inited: AtomicBool::new(false),
        }
    }

    /// The node table, exposed for embedders and tests.
    #[must_use]
    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    /// The wrapped filesystem.
    #[must_use]
    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    /// Drive the channel until it disconnects.
    pub fn run<C: Channel>(&self, chan: &C) -> Result<(), ServeError> {
        let result = loop {
            let frame = match chan.receive() {
                Ok(frame) => frame,
                Err(ChannelError::Retry) => continue,
                Err(ChannelError::Disconnected) => break Ok(()),
                Err(ChannelError::Io(errno)) => break Err(ServeError::Channel(errno)),
            };
            match self.handle(chan, &frame) {
                Ok(()) | Err(ChannelError::Retry) => {}
                Err(ChannelError::Disconnected) => break Ok(()),
                Err(ChannelError::Io(errno)) => break Err(ServeError::Channel(errno)),
            }
        };
        self.fs.destroy();
        result
    }

    /// Process one framed request, replying on `chan` unless the opcode
    /// carries no reply.
    pub fn handle<C: Channel>(&self, chan: &C, frame: &[u8]) -> Result<(), ChannelError> {
        let Ok((header, body)) = wire::split_request(frame) else {
            warn!("dropping malformed request frame");
            return Ok(());
        };
        let Some(opcode) = Opcode::from_u32(header.opcode) else {
            debug!(opcode = header.opcode, "unknown opcode");
            return chan.send(&wire::frame_error(header.unique, libc::ENOSYS));
        };
        let ctx = FsContext {
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
        };

        match opcode {
            Opcode::Forget => {
                if let Ok((arg, _)) = wire::payload::<ForgetIn>(body) {
                    self.nodes.forget(header.nodeid, arg.nlookup);
                }
                return Ok(());
            }
            Opcode::Interrupt => {
                if let Ok((arg, _)) = wire::payload::<InterruptIn>(body) {
                    self.note_interrupt(arg.unique);
                }
                return Ok(());
            }
            _ => {}
        }

        if self.take_interrupted(header.unique) {
            debug!(unique = header.unique, "request was interrupted before handling");
            return chan.send(&wire::frame_error(header.unique, libc::EINTR));
        }
        if !self.inited.load(Ordering::Acquire) && opcode != Opcode::Init {
            return chan.send(&wire::frame_error(header.unique, libc::EIO));
        }

        let reply = self.serve_op(opcode, header.nodeid, &ctx, body);
        match reply {
            Ok(body) => chan.send(&wire::frame_reply_bytes(header.unique, &body)),
            Err(errno) => chan.send(&wire::frame_error(header.unique, errno)),
        }
    }

    #[expect(clippy::too_many_lines, reason = "one arm per wire opcode")]
    fn serve_op(&self, opcode: Opcode, nodeid: u64, ctx: &FsContext, body: &[u8]) -> HandlerResult {
        match opcode {
            Opcode::Init => self.do_init(ctx, body),
            Opcode::Lookup => {
                let (name, _) = take_name(body)?;
                self.entry_reply(ctx, nodeid, name)
            }
            Opcode::Getattr => {
                let _ = decode::<GetattrIn>(body)?;
                let path = self.path_of(nodeid)?;
                let stat = self.fs.getattr(ctx, &path)?;
                self.nodes
                    .set_cached_stat(nodeid, systime(stat.mtime), stat.size);
                Ok(self.attr_reply(nodeid, &stat))
            }
            Opcode::Setattr | Opcode::SetattrX => {
                let arg = decode::<SetattrIn>(body)?;
                let path = self.path_of(nodeid)?;
                self.apply_setattr(ctx, &path, &arg)?;
                let stat = self.fs.getattr(ctx, &path)?;
                Ok(self.attr_reply(nodeid, &stat))
            }
            Opcode::Readlink => {
                let path = self.path_of(nodeid)?;
                let target = self.fs.readlink(ctx, &path)?;
                Ok(Bytes::from(target.as_bytes().to_vec()))
            }
            Opcode::Symlink => {
                let (name, rest) = take_name(body)?;
                // The link target is a path, not a name; only NUL-split it.
                let (target, _) = wire::split_name(rest).map_err(|_| libc::EINVAL)?;
                let target = OsStr::from_bytes(target);
                let path = self.path_of_name(nodeid, name)?;
                self.fs.symlink(ctx, target, &path)?;
                self.entry_reply(ctx, nodeid, name)
            }
            Opcode::Mknod => {
                let arg = decode::<MknodIn>(body)?;
                let (name, _) = take_name(&body[size_of::<MknodIn>()..])?;
                let path = self.path_of_name(nodeid, name)?;
                self.fs.mknod(ctx, &path, arg.mode, arg.rdev)?;
                self.entry_reply(ctx, nodeid, name)
            }
            Opcode::Mkdir => {
                let arg = decode::<MkdirIn>(body)?;
                let (name, _) = take_name(&body[size_of::<MkdirIn>()..])?;
                let path = self.path_of_name(nodeid, name)?;
                self.fs.mkdir(ctx, &path, arg.mode)?;
                self.entry_reply(ctx, nodeid, name)
            }
            Opcode::Unlink => {
                let (name, _) = take_name(body)?;
                self.do_unlink(ctx, nodeid, name)
            }
            Opcode::Rmdir => {
                let (name, _) = take_name(body)?;
                let path = self.path_of_name(nodeid, name)?;
                self.fs.rmdir(ctx, &path)?;
                self.nodes.remove_name(nodeid, name);
                Ok(Bytes::new())
            }
            Opcode::Rename => {
                let arg = decode::<RenameIn>(body)?;
                let rest = &body[size_of::<RenameIn>()..];
                let (oldname, rest) = take_name(rest)?;
                let (newname, _) = take_name(rest)?;
                self.do_rename(ctx, nodeid, oldname, arg.newdir, newname)
            }
            Opcode::Link => {
                let arg = decode::<LinkIn>(body)?;
                let (newname, _) = take_name(&body[size_of::<LinkIn>()..])?;
                let target = self.path_of(arg.oldnodeid)?;
                let path = self.path_of_name(nodeid, newname)?;
                self.fs.link(ctx, &target, &path)?;
                self.entry_reply(ctx, nodeid, newname)
            }
            Opcode::Open => {
                let arg = decode::<OpenIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fh = self.fs.open(ctx, &path, arg.flags)?;
                self.nodes.open_inc(nodeid);
                Ok(open_reply(fh))
            }
            Opcode::Read => {
                let arg = decode::<ReadIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fi = FileInfo {
                    flags: 0,
                    fh: arg.fh,
                };
                let data = self.fs.read(ctx, &path, &fi, arg.offset, arg.size)?;
                let data = if data.len() > arg.size as usize {
                    data.slice(..arg.size as usize)
                } else {
                    data
                };
                Ok(data)
            }
            Opcode::Write => {
                let arg = decode::<WriteIn>(body)?;
                let data = &body[size_of::<WriteIn>()..];
                let data = data.get(..arg.size as usize).ok_or(libc::EINVAL)?;
                let path = self.path_of(nodeid)?;
                let fi = FileInfo {
                    flags: 0,
                    fh: arg.fh,
                };
                let written = self.fs.write(ctx, &path, &fi, arg.offset, data)?;
                Ok(Bytes::copy_from_slice(
                    WriteOut {
                        size: written,
                        padding: 0,
                    }
                    .as_bytes(),
                ))
            }
            Opcode::Statfs => {
                let path = self.path_of(nodeid).unwrap_or_else(|_| PathBuf::from("/"));
                let stats = match self.fs.statfs(ctx, &path) {
                    Ok(stats) => stats,
                    Err(errno) if errno == libc::ENOSYS => crate::fs::FsStats::default(),
                    Err(errno) => return Err(errno),
                };
                let out = StatfsOut {
                    blocks: stats.total_blocks,
                    bfree: stats.free_blocks,
                    bavail: stats.available_blocks,
                    files: stats.total_inodes,
                    ffree: stats.free_inodes,
                    bsize: stats.block_size,
                    namelen: stats.max_filename_length,
                    frsize: stats.block_size,
                    ..StatfsOut::default()
                };
                Ok(Bytes::copy_from_slice(out.as_bytes()))
            }
            Opcode::Release => self.do_release(ctx, nodeid, body),
            Opcode::Flush => {
                let arg = decode::<FlushIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fi = FileInfo {
                    flags: 0,
                    fh: arg.fh,
                };
                self.drop_owner_locks(ctx, nodeid, &path, &fi, arg.lock_owner);
                self.fs.flush(ctx, &path, &fi)?;
                Ok(Bytes::new())
            }
            Opcode::Fsync | Opcode::Fsyncdir => {
                let arg = decode::<FsyncIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fi = FileInfo {
                    flags: 0,
                    fh: arg.fh,
                };
                let datasync = arg.fsync_flags & 1 != 0;
                if opcode == Opcode::Fsync {
                    self.fs.fsync(ctx, &path, &fi, datasync)?;
                } else {
                    self.fs.fsyncdir(ctx, &path, &fi, datasync)?;
                }
                Ok(Bytes::new())
            }
            Opcode::Setxattr => {
                let arg = decode::<SetxattrIn>(body)?;
                let rest = &body[size_of::<SetxattrIn>()..];
                let (name, value) = take_name(rest)?;
                let value = value.get(..arg.size as usize).ok_or(libc::EINVAL)?;
                let path = self.path_of(nodeid)?;
                self.fs
                    .setxattr(ctx, &path, name, value, arg.flags, arg.position)?;
                Ok(Bytes::new())
            }
            Opcode::Getxattr => {
                let arg = decode::<GetxattrIn>(body)?;
                let (name, _) = take_name(&body[size_of::<GetxattrIn>()..])?;
                let path = self.path_of(nodeid)?;
                let value = self.fs.getxattr(ctx, &path, name, arg.position)?;
                sized_reply(&value, arg.size)
            }
            Opcode::Listxattr => {
                let arg = decode::<GetxattrIn>(body)?;
                let path = self.path_of(nodeid)?;
                let names = self.fs.listxattr(ctx, &path)?;
                let mut packed = Vec::new();
                for name in &names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                sized_reply(&packed, arg.size)
            }
            Opcode::Removexattr => {
                let (name, _) = take_name(body)?;
                let path = self.path_of(nodeid)?;
                self.fs.removexattr(ctx, &path, name)?;
                Ok(Bytes::new())
            }
            Opcode::Opendir => {
                let _ = decode::<OpenIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fh = self.fs.opendir(ctx, &path)?;
                Ok(open_reply(fh))
            }
            Opcode::Readdir => {
                let arg = decode::<ReadIn>(body)?;
                self.do_readdir(ctx, nodeid, &arg)
            }
            Opcode::Releasedir => {
                let arg = decode::<ReleaseIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fi = FileInfo {
                    flags: arg.flags,
                    fh: arg.fh,
                };
                self.fs.releasedir(ctx, &path, &fi)?;
                Ok(Bytes::new())
            }
            Opcode::Getlk => {
                let arg = decode::<LkIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fi = FileInfo {
                    flags: 0,
                    fh: arg.fh,
                };
                let conflict = self.fs.getlk(
                    ctx,
                    &path,
                    &fi,
                    arg.owner,
                    arg.lk.start,
                    arg.lk.end,
                    arg.lk.typ,
                )?;
                let lk = conflict.map_or(
                    FileLock {
                        start: 0,
                        end: 0,
                        typ: libc::F_UNLCK,
                        pid: 0,
                    },
                    |(start, end, typ, pid)| FileLock {
                        start,
                        end,
                        typ,
                        pid,
                    },
                );
                Ok(Bytes::copy_from_slice(LkOut { lk }.as_bytes()))
            }
            Opcode::Setlk | Opcode::Setlkw => {
                let arg = decode::<LkIn>(body)?;
                let path = self.path_of(nodeid)?;
                let fi = FileInfo {
                    flags: 0,
                    fh: arg.fh,
                };
                self.fs.setlk(
                    ctx,
                    &path,
                    &fi,
                    arg.owner,
                    arg.lk.start,
                    arg.lk.end,
                    arg.lk.typ,
                    opcode == Opcode::Setlkw,
                )?;
                self.nodes.record_lock(nodeid, LockRange {
                    owner: arg.owner,
                    start: arg.lk.start,
                    end: arg.lk.end,
                    typ: arg.lk.typ,
                });
                Ok(Bytes::new())
            }
            Opcode::Access => {
                let arg = decode::<AccessIn>(body)?;
                let path = self.path_of(nodeid)?;
                self.fs.access(ctx, &path, arg.mask)?;
                Ok(Bytes::new())
            }
            Opcode::Create => {
                let arg = decode::<CreateIn>(body)?;
                let (name, _) = take_name(&body[size_of::<CreateIn>()..])?;
                let path = self.path_of_name(nodeid, name)?;
                let fh = self.fs.create(ctx, &path, arg.mode, arg.flags)?;
                let entry = self.entry_reply(ctx, nodeid, name)?;
                let (decoded, _) =
                    wire::payload::<EntryOut>(&entry).map_err(|_| libc::EIO)?;
                self.nodes.open_inc(decoded.nodeid);
                let mut combined = entry.to_vec();
                combined.extend_from_slice(open_reply(fh).as_ref());
                Ok(Bytes::from(combined))
            }
            Opcode::Bmap => {
                let arg = decode::<BmapIn>(body)?;
                let path = self.path_of(nodeid)?;
                let block = self.fs.bmap(ctx, &path, arg.blocksize, arg.block)?;
                Ok(Bytes::copy_from_slice(BmapOut { block }.as_bytes()))
            }
            Opcode::Setvolname => {
                let (name, _) = take_name(body)?;
                self.fs.setvolname(ctx, name)?;
                Ok(Bytes::new())
            }
            Opcode::Getxtimes => {
                let path = self.path_of(nodeid)?;
                let (bkuptime, crtime) = self.fs.getxtimes(ctx, &path)?;
                let (bsec, bnsec) = systime(bkuptime);
                let (csec, cnsec) = systime(crtime);
                #[expect(clippy::cast_sign_loss, reason = "wire xtimes are unsigned seconds")]
                let out = GetxtimesOut {
                    bkuptime: bsec as u64,
                    crtime: csec as u64,
                    bkuptimensec: bnsec,
                    crtimensec: cnsec,
                };
                Ok(Bytes::copy_from_slice(out.as_bytes()))
            }
            Opcode::Exchange => {
                let arg = decode::<ExchangeIn>(body)?;
                let rest = &body[size_of::<ExchangeIn>()..];
                let (name1, rest) = take_name(rest)?;
                let (name2, _) = take_name(rest)?;
                let path1 = self.path_of_name(arg.olddir, name1)?;
                let path2 = self.path_of_name(arg.newdir, name2)?;
                self.fs.exchange(ctx, &path1, &path2, arg.options)?;
                let _ = self.nodes.exchange(arg.olddir, name1, arg.newdir, name2);
                Ok(Bytes::new())
            }
            // Handled before dispatch; they carry no reply.
            Opcode::Forget | Opcode::Interrupt => Err(libc::ENOSYS),
        }
    }

    fn do_init(&self, ctx: &FsContext, body: &[u8]) -> HandlerResult {
        let arg = decode::<InitIn>(body)?;
        if arg.major != wire::KERNEL_VERSION {
            warn!(major = arg.major, "unsupported protocol major");
            return Err(libc::EPROTO);
        }
        if arg.minor < wire::MIN_SUPPORTED_MINOR {
            warn!(minor = arg.minor, "unsupported protocol minor");
            return Err(libc::EPROTONOSUPPORT);
        }
        let granted = self.config.flags & SessionFlags::from_bits_truncate(arg.flags);
        let out = InitOut {
            major: wire::KERNEL_VERSION,
            minor: wire::KERNEL_MINOR_VERSION,
            max_readahead: arg.max_readahead,
            flags: granted.bits(),
            unused: 0,
            max_write: self.config.max_write,
        };
        self.inited.store(true, Ordering::Release);
        self.fs.init(ctx);
        debug!(flags = ?granted, "handshake complete");
        Ok(Bytes::copy_from_slice(out.as_bytes()))
    }

    fn do_unlink(&self, ctx: &FsContext, parent: u64, name: &OsStr) -> HandlerResult {
        let path = self.path_of_name(parent, name)?;
        if !self.config.hard_remove && self.nodes.is_open(parent, name) {
            hide_node(&self.fs, &self.nodes, ctx, &path, parent, name)?;
            return Ok(Bytes::new());
        }
        self.fs.unlink(ctx, &path)?;
        self.nodes.remove_name(parent, name);
        Ok(Bytes::new())
    }

    fn do_rename(
        &self,
        ctx: &FsContext,
        olddir: u64,
        oldname: &OsStr,
        newdir: u64,
        newname: &OsStr,
    ) -> HandlerResult {
        let oldpath = self.path_of_name(olddir, oldname)?;
        let newpath = self.path_of_name(newdir, newname)?;
        if !self.config.hard_remove && self.nodes.is_open(newdir, newname) {
            // The rename target is open: hide it so its handles survive.
            hide_node(&self.fs, &self.nodes, ctx, &newpath, newdir, newname)?;
        }
        self.fs.rename(ctx, &oldpath, &newpath)?;
        self.nodes
            .rename(olddir, oldname, newdir, newname, false)
            .map_err(i32::from)?;
        Ok(Bytes::new())
    }

    fn do_release(&self, ctx: &FsContext, nodeid: u64, body: &[u8]) -> HandlerResult {
        let arg = decode::<ReleaseIn>(body)?;
        let path = self.path_of(nodeid)?;
        let fi = FileInfo {
            flags: arg.flags,
            fh: arg.fh,
        };
        self.drop_owner_locks(ctx, nodeid, &path, &fi, arg.lock_owner);
        let release_result = self.fs.release(ctx, &path, &fi);
        let (remaining, hidden) = self.nodes.open_dec(nodeid);
        if remaining == 0 && hidden {
            // Last close of a hidden file: the deferred unlink, against the
            // hidden name the node carries now.
            if let Err(errno) = self.fs.unlink(ctx, &path) {
                warn!(?path, errno, "failed to unlink hidden file");
            }
        }
        release_result?;
        Ok(Bytes::new())
    }

    fn do_readdir(&self, ctx: &FsContext, nodeid: u64, arg: &ReadIn) -> HandlerResult {
        let path = self.path_of(nodeid)?;
        let fi = FileInfo {
            flags: 0,
            fh: arg.fh,
        };
        let entries = self.fs.readdir(ctx, &path, &fi)?;
        let mut buf = DirentBuf::new(arg.size as usize);
        #[expect(
            clippy::cast_possible_truncation,
            reason = "directory offsets fit in usize on 64-bit hosts"
        )]
        for (index, entry) in entries.iter().enumerate().skip(arg.offset as usize) {
            let ino = if entry.ino == 0 {
                wire::UNKNOWN_INO
            } else {
                entry.ino
            };
            if !buf.push(ino, (index + 1) as u64, entry.typ, entry.name.as_bytes()) {
                break;
            }
        }
        Ok(buf.freeze())
    }

    fn apply_setattr(&self, ctx: &FsContext, path: &Path, arg: &SetattrIn) -> Result<(), i32> {
        let valid = SetattrValid::from_bits_truncate(arg.valid);
        if valid.contains(SetattrValid::MODE) {
            self.fs.chmod(ctx, path, arg.mode)?;
        }
        if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
            let uid = if valid.contains(SetattrValid::UID) {
                arg.uid
            } else {
                u32::MAX
            };
            let gid = if valid.contains(SetattrValid::GID) {
                arg.gid
            } else {
                u32::MAX
            };
            self.fs.chown(ctx, path, uid, gid)?;
        }
        if valid.contains(SetattrValid::SIZE) {
            self.fs.truncate(ctx, path, arg.size)?;
        }
        if valid.intersects(
            SetattrValid::ATIME
                | SetattrValid::MTIME
                | SetattrValid::ATIME_NOW
                | SetattrValid::MTIME_NOW,
        ) {
            let atime = setattr_time(
                valid,
                SetattrValid::ATIME,
                SetattrValid::ATIME_NOW,
                arg.atime,
                arg.atimensec,
            );
            let mtime = setattr_time(
                valid,
                SetattrValid::MTIME,
                SetattrValid::MTIME_NOW,
                arg.mtime,
                arg.mtimensec,
            );
            self.fs.utimens(ctx, path, atime, mtime)?;
        }
        if valid.contains(SetattrValid::CRTIME) {
            self.fs.setcrtime(ctx, path, TimeSpec {
                sec: arg.crtime,
                nsec: arg.crtimensec,
            })?;
        }
        if valid.contains(SetattrValid::BKUPTIME) {
            self.fs.setbkuptime(ctx, path, TimeSpec {
                sec: arg.bkuptime,
                nsec: arg.bkuptimensec,
            })?;
        }
        if valid.contains(SetattrValid::CHGTIME) {
            self.fs.setchgtime(ctx, path, TimeSpec {
                sec: arg.chgtime,
                nsec: arg.chgtimensec,
            })?;
        }
        if valid.contains(SetattrValid::FLAGS) {
            self.fs.chflags(ctx, path, arg.flags)?;
        }
        Ok(())
    }

    fn drop_owner_locks(
        &self,
        ctx: &FsContext,
        nodeid: u64,
        path: &Path,
        fi: &FileInfo,
        owner: u64,
    ) {
        if owner == 0 {
            return;
        }
        for lock in self.nodes.take_locks(nodeid, owner) {
            let result = self.fs.setlk(
                ctx,
                path,
                fi,
                owner,
                lock.start,
                lock.end,
                libc::F_UNLCK,
                false,
            );
            if let Err(errno) = result
                && errno != libc::ENOSYS
            {
                warn!(nodeid, errno, "failed to drop lock at release");
            }
        }
    }

    fn entry_reply(&self, ctx: &FsContext, parent: u64, name: &OsStr) -> HandlerResult {
        let path = self.path_of_name(parent, name)?;
        let stat = self.fs.getattr(ctx, &path)?;
        let node = self.nodes.lookup(parent, name).map_err(i32::from)?;
        self.nodes
            .set_cached_stat(node.nodeid, systime(stat.mtime), stat.size);
        let ttl = self.config.attr_ttl;
        let out = EntryOut {
            nodeid: node.nodeid,
            generation: node.generation,
            entry_valid: ttl.as_secs(),
            attr_valid: ttl.as_secs(),
            entry_valid_nsec: ttl.subsec_nanos(),
            attr_valid_nsec: ttl.subsec_nanos(),
            attr: stat_to_attr(node.nodeid, &stat),
        };
        Ok(Bytes::copy_from_slice(out.as_bytes()))
    }

    fn attr_reply(&self, nodeid: u64, stat: &FileStat) -> Bytes {
        let ttl = self.config.attr_ttl;
        let out = AttrOut {
            attr_valid: ttl.as_secs(),
            attr_valid_nsec: ttl.subsec_nanos(),
            dummy: 0,
            attr: stat_to_attr(nodeid, stat),
        };
        Bytes::copy_from_slice(out.as_bytes())
    }

    fn path_of(&self, nodeid: u64) -> Result<PathBuf, i32> {
        self.nodes.path_of(nodeid).map_err(i32::from)
    }

    fn path_of_name(&self, nodeid: u64, name: &OsStr) -> Result<PathBuf, i32> {
        self.nodes
            .path_of_name(nodeid, Some(name))
            .map_err(i32::from)
    }

    fn note_interrupt(&self, unique: u64) {
        let mut interrupted = self.lock_interrupted();
        if interrupted.len() >= INTERRUPT_BACKLOG {
            interrupted.clear();
        }
        interrupted.insert(unique);
    }

    fn take_interrupted(&self, unique: u64) -> bool {
        self.lock_interrupted().remove(&unique)
    }

    fn lock_interrupted(&self) -> MutexGuard<'_, FxHashSet<u64>> {
        match self.interrupted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn decode<T: zerocopy::FromBytes>(body: &[u8]) -> Result<T, i32> {
    wire::payload::<T>(body)
        .map(|(value, _)| value)
        .map_err(|_: ProtocolViolation| libc::EINVAL)
}

fn take_name(body: &[u8]) -> Result<(&OsStr, &[u8]), i32> {
    let (name, rest) = wire::split_name(body).map_err(|_| libc::EINVAL)?;
    if name.is_empty() || name.len() > wire::MAX_NAME {
        return Err(libc::EINVAL);
    }
    Ok((OsStr::from_bytes(name), rest))
}

fn open_reply(fh: u64) -> Bytes {
    Bytes::copy_from_slice(
        OpenOut {
            fh,
            open_flags: 0,
            padding: 0,
        }
        .as_bytes(),
    )
}

fn sized_reply(data: &[u8], requested: u32) -> HandlerResult {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "xattr payloads are far below u32::MAX"
    )]
    let actual = data.len() as u32;
    if requested == 0 {
        let out = GetxattrOut {
            size: actual,
            padding: 0,
        };
        Ok(Bytes::copy_from_slice(out.as_bytes()))
    } else if actual > requested {
        Err(libc::ERANGE)
    } else {
        Ok(Bytes::copy_from_slice(data))
    }
}

fn systime(t: SystemTime) -> (i64, u32) {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        #[expect(
            clippy::cast_possible_wrap,
            reason = "seconds since the epoch fit in i64 for any real clock"
        )]
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            #[expect(clippy::cast_possible_wrap, reason = "pre-epoch offsets are small")]
            (-(d.as_secs() as i64), d.subsec_nanos())
        }
    }
}

fn stat_to_attr(nodeid: u64, stat: &FileStat) -> Attr {
    let (asec, ansec) = systime(stat.atime);
    let (msec, mnsec) = systime(stat.mtime);
    let (csec, cnsec) = systime(stat.ctime);
    let (crsec, crnsec) = systime(stat.crtime);
    Attr {
        ino: nodeid,
        size: stat.size,
        blocks: stat.blocks,
        atime: asec,
        mtime: msec,
        ctime: csec,
        crtime: crsec,
        atimensec: ansec,
        mtimensec: mnsec,
        ctimensec: cnsec,
        crtimensec: crnsec,
        mode: stat.mode,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        flags: stat.flags,
        blksize: wire::DEFAULT_BLOCKSIZE,
        padding: 0,
    }
}
