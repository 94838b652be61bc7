//! The VFS adapter: translates host VFS callbacks into dispatches.
//!
//! One [`Vfs`] per mount. It owns the attribute and name caches, the
//! file-handle table, and the page model, and it enforces the coherence
//! rules around size changes and EXCHANGE. Host VFS glue for a concrete
//! kernel is out of scope; these methods are the operations such glue would
//! call.

/// Attribute and name caches.
pub mod attr;
/// Per-inode file-handle table.
pub mod handle;
/// Page/UBC model.
pub mod pages;
/// READDIR reply decoding.
pub mod readdir;

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashSet;
use tracing::{debug, instrument, warn};
use zerocopy::IntoBytes;

use crate::device::{AvfiFlags, AvfiRequest, AvfiSink, UbcFlags};
use crate::dispatch::{Request, dispatch, notify_forget};
use crate::error::TransportError;
use crate::session::Session;
use crate::ticket::Reply;
use crate::wire::{
    self, AccessIn, Attr, AttrOut, BmapIn, BmapOut, Caller, CreateIn, EntryOut, ExchangeIn,
    FlushIn, FsyncIn, GetattrIn, GetxattrIn, GetxattrOut, GetxtimesOut, InitOut, LinkIn, LkIn,
    LkOut, MkdirIn, MknodIn, Opcode, OpenIn, OpenOut, ReadIn, ReleaseIn, RenameIn, SessionFlags,
    SetattrIn, SetattrValid, SetxattrIn, StatfsOut, WriteIn, WriteOut,
};

pub use attr::{AttrCache, NameCache, NameHit};
pub use handle::{AccessMode, HandleTable};
pub use pages::PageCache;
pub use readdir::DirEntry;

bitflags! {
    /// Mount options observed by the adapter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountOptions: u32 {
        /// Check permissions locally; never forward ACCESS.
        const DEFAULT_PERMISSIONS = 1 << 0;
        /// Allow every access; permissions surface on later operations.
        const DEFER_PERMISSIONS   = 1 << 1;
        /// Bypass the page cache; implies no readahead and no name cache.
        const DIRECT_IO           = 1 << 2;
        /// Lift the owner-only access restriction for everyone.
        const ALLOW_OTHER         = 1 << 3;
        /// Lift the owner-only access restriction for root.
        const ALLOW_ROOT          = 1 << 4;
        /// Keep cached pages across OPEN iff mtime and size are unchanged.
        const AUTO_CACHE          = 1 << 5;
        /// Never hide deleted-but-open files; always UNLINK immediately.
        const HARD_REMOVE         = 1 << 6;
        /// Hide `.DS_Store` and `._*` names in READDIR.
        const NO_APPLE_DOUBLE     = 1 << 7;
        /// Reject Apple-namespace extended attributes.
        const NO_APPLE_XATTR      = 1 << 8;
        /// Treat FSYNC as satisfied without a round trip.
        const NO_SYNCWRITES       = 1 << 9;
        /// Disable the unified buffer cache.
        const NO_UBC              = 1 << 10;
        /// Disable the name cache.
        const NO_VNCACHE          = 1 << 11;
        /// Disable the attribute cache.
        const NO_ATTRCACHE        = 1 << 12;
        /// Cache negative name lookups.
        const NEGATIVE_VNCACHE    = 1 << 13;
        /// Expose backup and creation times.
        const XTIMES              = 1 << 14;
        /// Report sparse allocation sizes.
        const SPARSE              = 1 << 15;
        /// Honour extended security attributes.
        const EXTENDED_SECURITY   = 1 << 16;
    }
}

/// Per-mount configuration.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Option flags.
    pub options: MountOptions,
    /// How long cached attributes stay fresh.
    pub attr_ttl: Duration,
    /// Uid of the mounting user, for the owner access gate.
    pub owner_uid: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            options: MountOptions::empty(),
            attr_ttl: Duration::from_secs(1),
            owner_uid: 0,
        }
    }
}

/// A getxattr/listxattr result: either the required size or the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// Size probe answer.
    Size(u32),
    /// The attribute value or the packed name list.
    Data(Bytes),
}

/// One side of an EXCHANGE.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeTarget<'a> {
    /// Directory the path lives in.
    pub dir: u64,
    /// Final path component.
    pub name: &'a OsStr,
    /// Inode currently behind the name.
    pub ino: u64,
}

/// The per-mount VFS adapter.
pub struct Vfs {
    session: Arc<Session>,
    config: MountConfig,
    attrs: AttrCache,
    names: NameCache,
    handles: HandleTable,
    pages: PageCache,
    creating: Mutex<FxHashSet<(u64, OsString)>>,
    created_cv: Condvar,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("options", &self.config.options)
            .finish_non_exhaustive()
    }
}

type VfsResult<T> = Result<T, TransportError>;

impl Vfs {
    /// Bind an adapter to a session and mark the session mounted.
    #[must_use]
    pub fn mount(session: Arc<Session>, config: MountConfig) -> Arc<Self> {
        let opts = config.options;
        let direct = opts.contains(MountOptions::DIRECT_IO);
        let vfs = Arc::new(Self {
            attrs: AttrCache::new(
                config.attr_ttl,
                !opts.contains(MountOptions::NO_ATTRCACHE),
            ),
            names: NameCache::new(
                !direct && !opts.contains(MountOptions::NO_VNCACHE),
                opts.contains(MountOptions::NEGATIVE_VNCACHE),
            ),
            handles: HandleTable::new(),
            pages: PageCache::new(!direct && !opts.contains(MountOptions::NO_UBC)),
            creating: Mutex::new(FxHashSet::default()),
            created_cv: Condvar::new(),
            config,
            session: Arc::clone(&session),
        });
        session.attach_mount();
        let vfs_trait: Arc<dyn AvfiSink + Send + Sync> = vfs.clone();
        let sink: std::sync::Weak<dyn AvfiSink + Send + Sync> = Arc::downgrade(&vfs_trait);
        session.set_avfi_sink(sink);
        vfs
    }

    /// The session this mount dispatches on.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The mount options in effect.
    #[must_use]
    pub fn options(&self) -> MountOptions {
        self.config.options
    }

    /// Detach the mount. The slot tears the session down once the device
    /// is also closed.
    pub fn unmount(&self) {
        self.session.detach_mount();
    }

    /// Drive the INIT handshake. Must complete before other operations.
    pub fn init(&self, caller: Caller) -> VfsResult<()> {
        let payload = self.session.init_request();
        let reply = dispatch(
            &self.session,
            Request::new(Opcode::Init, 0, caller, payload.as_bytes()),
        )?;
        let (out, _) = wire::payload::<InitOut>(&reply.body)
            .map_err(|v| self.protocol_failure(v))?;
        self.session.complete_init(&out)?;
        debug!(minor = out.minor, max_write = out.max_write, "handshake complete");
        Ok(())
    }

    /// Owner gate: unless widened by `allow_other` / `allow_root`, only the
    /// mounting user may touch the mount.
    fn gate(&self, caller: Caller) -> VfsResult<()> {
        let opts = self.config.options;
        if opts.contains(MountOptions::ALLOW_OTHER) {
            return Ok(());
        }
        if caller.uid == self.config.owner_uid {
            return Ok(());
        }
        if opts.contains(MountOptions::ALLOW_ROOT) && caller.uid == 0 {
            return Ok(());
        }
        Err(TransportError::Errno(libc::EACCES))
    }

    fn send(&self, opcode: Opcode, nodeid: u64, caller: Caller, payload: &[u8]) -> VfsResult<Reply> {
        dispatch(&self.session, Request::new(opcode, nodeid, caller, payload))
    }

    /// A reply body too short for its opcode is a protocol violation and
    /// kills the whole session.
    fn protocol_failure(&self, violation: crate::error::ProtocolViolation) -> TransportError {
        warn!(%violation, "malformed reply, killing session");
        self.session.set_dead();
        TransportError::Protocol(violation)
    }

    /// LOOKUP: resolve `name` under `parent`.
    #[instrument(name = "Vfs::lookup", skip(self, caller))]
    pub fn lookup(&self, caller: Caller, parent: u64, name: &OsStr) -> VfsResult<EntryOut> {
        self.gate(caller)?;
        self.wait_not_creating(parent, name);
        let cached_ino = match self.names.lookup(parent, name) {
            NameHit::Negative => return Err(TransportError::Errno(libc::ENOENT)),
            NameHit::Found { ino, generation } => {
                if let Some(attr) = self.attrs.fresh(ino) {
                    return Ok(self.entry_out(ino, generation, attr));
                }
                Some(ino)
            }
            NameHit::Miss => None,
        };

        match self.send(Opcode::Lookup, parent, caller, &name_bytes(name)) {
            Ok(reply) => {
                let (entry, _) = wire::payload::<EntryOut>(&reply.body)
                    .map_err(|v| self.protocol_failure(v))?;
                self.attrs.store(entry.attr);
                self.names.store(parent, name, entry.nodeid, entry.generation);
                Ok(entry)
            }
            Err(TransportError::Errno(libc::ENOENT)) => {
                if let Some(ino) = cached_ino {
                    // A name we held resolved to nothing: soft revoke.
                    self.revoke(ino);
                }
                self.names.purge(parent, name);
                self.names.store_negative(parent, name);
                Err(TransportError::Errno(libc::ENOENT))
            }
            Err(e) => Err(e),
        }
    }

    /// GETATTR, served from cache while fresh.
    #[instrument(name = "Vfs::getattr", skip(self, caller))]
    pub fn getattr(&self, caller: Caller, ino: u64) -> VfsResult<Attr> {
        self.gate(caller)?;
        if let Some(attr) = self.attrs.fresh(ino) {
            return Ok(attr);
        }
        let known = self.attrs.knows(ino);
        let payload = GetattrIn::default();
        match self.send(Opcode::Getattr, ino, caller, payload.as_bytes()) {
            Ok(reply) => {
                let (out, _) = wire::payload::<AttrOut>(&reply.body)
                    .map_err(|v| self.protocol_failure(v))?;
                self.attrs.store(out.attr);
                Ok(out.attr)
            }
            Err(TransportError::Errno(libc::ENOENT)) if known => {
                self.revoke(ino);
                Err(TransportError::Errno(libc::ENOENT))
            }
            Err(e) => Err(e),
        }
    }

    /// SETATTR / SETATTR_X. A size change pushes and invalidates cached
    /// pages so they never shadow the new content.
    #[instrument(name = "Vfs::setattr", skip(self, caller, change))]
    pub fn setattr(&self, caller: Caller, ino: u64, change: &SetattrIn) -> VfsResult<Attr> {
        self.gate(caller)?;
        let valid = SetattrValid::from_bits_truncate(change.valid);
        if valid.contains(SetattrValid::SIZE) {
            self.pages.push(ino);
            self.pages.invalidate(ino);
        }
        let extended = valid.intersects(
            SetattrValid::CRTIME
                | SetattrValid::CHGTIME
                | SetattrValid::BKUPTIME
                | SetattrValid::FLAGS,
        );
        let opcode = if extended { Opcode::SetattrX } else { Opcode::Setattr };
        self.attrs.invalidate(ino);
        let reply = self.send(opcode, ino, caller, change.as_bytes())?;
        let (out, _) =
            wire::payload::<AttrOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
        self.attrs.store(out.attr);
        if valid.contains(SetattrValid::SIZE) {
            self.pages.truncate(ino, out.attr.size);
        }
        Ok(out.attr)
    }

    /// OPEN. At most one server handle per (inode, access mode) is kept;
    /// concurrent opens share it through a reference count.
    #[instrument(name = "Vfs::open", skip(self, caller))]
    pub fn open(&self, caller: Caller, ino: u64, flags: u32) -> VfsResult<u64> {
        self.gate(caller)?;
        let mode = AccessMode::from_flags(flags);
        if let Some(fh) = self.handles.retain(ino, mode) {
            return Ok(fh);
        }
        let before = self.attrs.cached_mtime_size(ino);
        let payload = OpenIn { flags, unused: 0 };
        let reply = self.send(Opcode::Open, ino, caller, payload.as_bytes())?;
        let (out, _) =
            wire::payload::<OpenOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
        self.handles.register(ino, mode, out.fh);
        if self.config.options.contains(MountOptions::AUTO_CACHE) {
            self.auto_cache_check(caller, ino, before);
        }
        Ok(out.fh)
    }

    /// `auto_cache`: keep pages across OPEN iff mtime and size are
    /// unchanged since they were cached.
    fn auto_cache_check(&self, caller: Caller, ino: u64, before: Option<(i64, u32, u64)>) {
        self.attrs.invalidate(ino);
        let Ok(now) = self.getattr(caller, ino) else {
            self.pages.invalidate(ino);
            return;
        };
        let unchanged = before
            .is_some_and(|(mtime, mtimensec, size)| {
                now.mtime == mtime && now.mtimensec == mtimensec && now.size == size
            });
        if !unchanged {
            debug!(ino, "auto_cache: content changed, dropping pages");
            self.pages.invalidate(ino);
        }
    }

    /// CREATE: atomically create and open. Holds the "file being created"
    /// flag for the (parent, name) pair so concurrent lookups wait out the
    /// CREATE→OPEN window.
    #[instrument(name = "Vfs::create", skip(self, caller))]
    pub fn create(
        &self,
        caller: Caller,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> VfsResult<(EntryOut, u64)> {
        self.gate(caller)?;
        self.begin_creating(parent, name);
        let result = self.create_inner(caller, parent, name, mode, flags);
        self.end_creating(parent, name);
        result
    }

    fn create_inner(
        &self,
        caller: Caller,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> VfsResult<(EntryOut, u64)> {
        let header = CreateIn { flags, mode };
        let mut payload = BytesMut::with_capacity(size_of::<CreateIn>() + name.len() + 1);
        payload.put_slice(header.as_bytes());
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        let reply = self.send(Opcode::Create, parent, caller, &payload)?;
        let (entry, rest) =
            wire::payload::<EntryOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
        let (open, _) = wire::payload::<OpenOut>(rest).map_err(|v| self.protocol_failure(v))?;
        self.attrs.invalidate(parent);
        self.attrs.store(entry.attr);
        self.names.store(parent, name, entry.nodeid, entry.generation);
        self.handles
            .register(entry.nodeid, AccessMode::from_flags(flags), open.fh);
        Ok((entry, open.fh))
    }

    /// READ on an open handle.
    ///
    /// With the page cache on, the request is clipped to the cached file
    /// size: reads at EOF come back short, reads past EOF are invalid.
    #[instrument(name = "Vfs::read", skip(self, caller))]
    pub fn read(&self, caller: Caller, ino: u64, offset: u64, size: u32) -> VfsResult<Bytes> {
        self.gate(caller)?;
        let (mode, fh) = self
            .begin_io(ino, AccessMode::Read)
            .ok_or(TransportError::Errno(libc::EBADF))?;
        let result = self.read_inner(caller, ino, fh, offset, size);
        self.handles.io_end(ino, mode);
        result
    }

    fn read_inner(
        &self,
        caller: Caller,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> VfsResult<Bytes> {
        let mut want = size as usize;
        if !self.config.options.contains(MountOptions::DIRECT_IO) {
            let fsize = match self.attrs.cached_size(ino) {
                Some(size) => size,
                None => self.getattr(caller, ino)?.size,
            };
            if offset > fsize {
                return Err(TransportError::Errno(libc::EINVAL));
            }
            #[expect(
                clippy::cast_possible_truncation,
                reason = "clipped length is at most the u32 request size"
            )]
            let available = (fsize - offset) as usize;
            want = want.min(available);
            if want == 0 {
                return Ok(Bytes::new());
            }
            if let Some(hit) = self.pages.read(ino, offset, want) {
                return Ok(hit);
            }
        }

        let iosize = self.session.config().iosize as usize;
        let mut out = BytesMut::with_capacity(want);
        let mut pos = offset;
        while out.len() < want {
            #[expect(
                clippy::cast_possible_truncation,
                reason = "chunk is bounded by iosize, which is a u32"
            )]
            let chunk = (want - out.len()).min(iosize) as u32;
            let payload = ReadIn {
                fh,
                offset: pos,
                size: chunk,
                padding: 0,
            };
            let reply = self.send(Opcode::Read, ino, caller, payload.as_bytes())?;
            let got = reply.body.len();
            out.put_slice(&reply.body);
            pos += got as u64;
            if got < chunk as usize {
                break;
            }
        }
        let data = out.freeze();
        self.pages.store(ino, offset, &data);
        Ok(data)
    }

    /// WRITE on an open handle, chunked by the negotiated `max_write`
    /// rounded to the session block size. The data buffer is externally
    /// owned; chunks reference it without copying.
    #[instrument(name = "Vfs::write", skip(self, caller, data))]
    pub fn write(&self, caller: Caller, ino: u64, offset: u64, data: Bytes) -> VfsResult<u64> {
        self.gate(caller)?;
        let (mode, fh) = self
            .begin_io(ino, AccessMode::Write)
            .ok_or(TransportError::Errno(libc::EBADF))?;
        let result = self.write_inner(caller, ino, fh, offset, data);
        self.handles.io_end(ino, mode);
        result
    }

    fn write_inner(
        &self,
        caller: Caller,
        ino: u64,
        fh: u64,
        offset: u64,
        data: Bytes,
    ) -> VfsResult<u64> {
        let blocksize = self.session.config().blocksize.max(1) as usize;
        let max_write = self.session.max_write() as usize;
        let chunk_cap = (max_write / blocksize * blocksize).max(blocksize);

        let mut written = 0_usize;
        while written < data.len() {
            let take = (data.len() - written).min(chunk_cap);
            let slice = data.slice(written..written + take);
            #[expect(
                clippy::cast_possible_truncation,
                reason = "chunk is bounded by max_write, which is a u32"
            )]
            let payload = WriteIn {
                fh,
                offset: offset + written as u64,
                size: take as u32,
                write_flags: 0,
            };
            let reply = dispatch(
                &self.session,
                Request::new(Opcode::Write, ino, caller, payload.as_bytes())
                    .with_data(slice.clone()),
            )?;
            let (out, _) =
                wire::payload::<WriteOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
            let accepted = (out.size as usize).min(take);
            self.pages
                .store(ino, offset + written as u64, &slice.slice(..accepted));
            written += accepted;
            if accepted < take {
                break;
            }
        }

        let end = offset + written as u64;
        if self.attrs.cached_size(ino).is_some_and(|s| s < end) {
            self.attrs.update_size(ino, end);
        }
        Ok(written as u64)
    }

    /// RELEASE on the last close of an (inode, mode) handle, after every
    /// in-flight READ/WRITE on it has finished.
    #[instrument(name = "Vfs::release", skip(self, caller))]
    pub fn release(&self, caller: Caller, ino: u64, flags: u32) -> VfsResult<()> {
        self.gate(caller)?;
        let mode = AccessMode::from_flags(flags);
        let Some(fh) = self.handles.close(ino, mode) else {
            return Ok(());
        };
        let payload = ReleaseIn {
            fh,
            flags,
            release_flags: 0,
            lock_owner: 0,
        };
        match self.send(Opcode::Release, ino, caller, payload.as_bytes()) {
            Ok(_) | Err(TransportError::NotSupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// FLUSH at close time. "Not implemented" is a no-op success.
    pub fn flush(&self, caller: Caller, ino: u64, lock_owner: u64) -> VfsResult<()> {
        self.gate(caller)?;
        let fh = self
            .any_handle(ino)
            .ok_or(TransportError::Errno(libc::EBADF))?;
        let payload = FlushIn {
            fh,
            unused: 0,
            padding: 0,
            lock_owner,
        };
        match self.send(Opcode::Flush, ino, caller, payload.as_bytes()) {
            Ok(_) | Err(TransportError::NotSupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// FSYNC / FSYNCDIR. "Not implemented" is a no-op success, as is the
    /// whole call under `no_syncwrites`.
    pub fn fsync(&self, caller: Caller, ino: u64, datasync: bool, dir: bool) -> VfsResult<()> {
        self.gate(caller)?;
        if self.config.options.contains(MountOptions::NO_SYNCWRITES) {
            return Ok(());
        }
        let fh = self.any_handle(ino).unwrap_or(0);
        let payload = FsyncIn {
            fh,
            fsync_flags: u32::from(datasync),
            padding: 0,
        };
        let opcode = if dir { Opcode::Fsyncdir } else { Opcode::Fsync };
        match self.send(opcode, ino, caller, payload.as_bytes()) {
            Ok(_) | Err(TransportError::NotSupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// OPENDIR.
    pub fn opendir(&self, caller: Caller, ino: u64, flags: u32) -> VfsResult<u64> {
        self.gate(caller)?;
        let payload = OpenIn { flags, unused: 0 };
        let reply = self.send(Opcode::Opendir, ino, caller, payload.as_bytes())?;
        let (out, _) =
            wire::payload::<OpenOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
        Ok(out.fh)
    }

    /// READDIR: one server round trip, decoded into host entries.
    #[instrument(name = "Vfs::readdir", skip(self, caller))]
    pub fn readdir(
        &self,
        caller: Caller,
        ino: u64,
        fh: u64,
        offset: u64,
    ) -> VfsResult<Vec<DirEntry>> {
        self.gate(caller)?;
        let payload = ReadIn {
            fh,
            offset,
            size: self.session.config().iosize,
            padding: 0,
        };
        let reply = self.send(Opcode::Readdir, ino, caller, payload.as_bytes())?;
        readdir::decode_readdir(
            &reply.body,
            self.config.options.contains(MountOptions::NO_APPLE_DOUBLE),
        )
    }

    /// RELEASEDIR.
    pub fn releasedir(&self, caller: Caller, ino: u64, fh: u64, flags: u32) -> VfsResult<()> {
        self.gate(caller)?;
        let payload = ReleaseIn {
            fh,
            flags,
            release_flags: 0,
            lock_owner: 0,
        };
        match self.send(Opcode::Releasedir, ino, caller, payload.as_bytes()) {
            Ok(_) | Err(TransportError::NotSupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// UNLINK. Cached state for the name and its inode is dropped; sibling
    /// links keep their caches until their own deadlines pass.
    #[instrument(name = "Vfs::unlink", skip(self, caller))]
    pub fn unlink(&self, caller: Caller, parent: u64, name: &OsStr) -> VfsResult<()> {
        self.gate(caller)?;
        self.remove_common(Opcode::Unlink, caller, parent, name)
    }

    /// RMDIR.
    pub fn rmdir(&self, caller: Caller, parent: u64, name: &OsStr) -> VfsResult<()> {
        self.gate(caller)?;
        self.remove_common(Opcode::Rmdir, caller, parent, name)
    }

    fn remove_common(
        &self,
        opcode: Opcode,
        caller: Caller,
        parent: u64,
        name: &OsStr,
    ) -> VfsResult<()> {
        let target = match self.names.lookup(parent, name) {
            NameHit::Found { ino, .. } => Some(ino),
            _ => None,
        };
        self.send(opcode, parent, caller, &name_bytes(name))?;
        self.attrs.invalidate(parent);
        self.names.purge(parent, name);
        if let Some(ino) = target {
            self.attrs.invalidate(ino);
            self.pages.invalidate(ino);
        }
        Ok(())
    }

    /// RENAME.
    #[instrument(name = "Vfs::rename", skip(self, caller))]
    pub fn rename(
        &self,
        caller: Caller,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> VfsResult<()> {
        self.gate(caller)?;
        let header = RenameIn { newdir: newparent };
        let mut payload =
            BytesMut::with_capacity(size_of::<RenameIn>() + name.len() + newname.len() + 2);
        payload.put_slice(header.as_bytes());
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        payload.put_slice(newname.as_bytes());
        payload.put_u8(0);
        self.send(Opcode::Rename, parent, caller, &payload)?;
        self.attrs.invalidate(parent);
        self.attrs.invalidate(newparent);
        self.names.purge(parent, name);
        self.names.purge(newparent, newname);
        Ok(())
    }

    /// EXCHANGE: atomic content swap of two existing paths. Both inodes'
    /// pages are pushed first and every cache that could shadow the swap is
    /// invalidated afterwards.
    #[instrument(name = "Vfs::exchange", skip(self, caller, a, b))]
    pub fn exchange(
        &self,
        caller: Caller,
        a: ExchangeTarget<'_>,
        b: ExchangeTarget<'_>,
        options: u64,
    ) -> VfsResult<()> {
        self.gate(caller)?;
        self.pages.push(a.ino);
        self.pages.push(b.ino);
        let header = ExchangeIn {
            olddir: a.dir,
            newdir: b.dir,
            options,
        };
        let mut payload = BytesMut::with_capacity(
            size_of::<ExchangeIn>() + a.name.len() + b.name.len() + 2,
        );
        payload.put_slice(header.as_bytes());
        payload.put_slice(a.name.as_bytes());
        payload.put_u8(0);
        payload.put_slice(b.name.as_bytes());
        payload.put_u8(0);
        self.send(Opcode::Exchange, a.dir, caller, &payload)?;
        for ino in [a.ino, b.ino] {
            self.attrs.invalidate(ino);
            self.pages.invalidate(ino);
        }
        self.names.purge(a.dir, a.name);
        self.names.purge(b.dir, b.name);
        Ok(())
    }

    /// MKNOD.
    pub fn mknod(
        &self,
        caller: Caller,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> VfsResult<EntryOut> {
        self.gate(caller)?;
        let header = MknodIn { mode, rdev };
        self.entry_request(Opcode::Mknod, caller, parent, name, header.as_bytes())
    }

    /// MKDIR.
    pub fn mkdir(&self, caller: Caller, parent: u64, name: &OsStr, mode: u32) -> VfsResult<EntryOut> {
        self.gate(caller)?;
        let header = MkdirIn { mode, padding: 0 };
        self.entry_request(Opcode::Mkdir, caller, parent, name, header.as_bytes())
    }

    /// SYMLINK: `name` under `parent` pointing at `target`.
    pub fn symlink(
        &self,
        caller: Caller,
        parent: u64,
        name: &OsStr,
        target: &OsStr,
    ) -> VfsResult<EntryOut> {
        self.gate(caller)?;
        let mut payload = BytesMut::with_capacity(name.len() + target.len() + 2);
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        payload.put_slice(target.as_bytes());
        payload.put_u8(0);
        let reply = self.send(Opcode::Symlink, parent, caller, &payload)?;
        self.finish_entry(parent, name, &reply)
    }

    /// LINK: a new name for an existing inode.
    pub fn link(
        &self,
        caller: Caller,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
    ) -> VfsResult<EntryOut> {
        self.gate(caller)?;
        let header = LinkIn { oldnodeid: ino };
        self.entry_request(Opcode::Link, caller, newparent, newname, header.as_bytes())
    }

    /// READLINK.
    pub fn readlink(&self, caller: Caller, ino: u64) -> VfsResult<Bytes> {
        self.gate(caller)?;
        let reply = self.send(Opcode::Readlink, ino, caller, &[])?;
        Ok(reply.body)
    }

    /// STATFS. "Not implemented" degrades to synthetic defaults.
    pub fn statfs(&self, caller: Caller, ino: u64) -> VfsResult<StatfsOut> {
        self.gate(caller)?;
        match self.send(Opcode::Statfs, ino, caller, &[]) {
            Ok(reply) => {
                let (out, _) = wire::payload::<StatfsOut>(&reply.body)
                    .map_err(|v| self.protocol_failure(v))?;
                Ok(out)
            }
            Err(TransportError::NotSupported) => {
                let namelen = u32::try_from(wire::MAX_NAME).unwrap_or(255);
                Ok(StatfsOut {
                    bsize: self.session.config().blocksize,
                    namelen,
                    ..StatfsOut::default()
                })
            }
            Err(e) => Err(e),
        }
    }

    /// ACCESS, under the mount's permission policy.
    pub fn access(&self, caller: Caller, ino: u64, mask: u32) -> VfsResult<()> {
        self.gate(caller)?;
        let opts = self.config.options;
        if opts.contains(MountOptions::DEFER_PERMISSIONS) {
            return Ok(());
        }
        if opts.contains(MountOptions::DEFAULT_PERMISSIONS) {
            let attr = self.getattr(caller, ino)?;
            return check_access_bits(&attr, caller, mask);
        }
        let known = self.attrs.knows(ino);
        let payload = AccessIn { mask, padding: 0 };
        match self.send(Opcode::Access, ino, caller, payload.as_bytes()) {
            Ok(_) | Err(TransportError::NotSupported) => Ok(()),
            Err(TransportError::Errno(libc::ENOENT)) if known => {
                self.revoke(ino);
                Err(TransportError::Errno(libc::ENOENT))
            }
            Err(e) => Err(e),
        }
    }

    /// GETXTIMES. Degrades to zeroed times when the server lacks it or the
    /// mount did not ask for extended times.
    pub fn getxtimes(&self, caller: Caller, ino: u64) -> VfsResult<GetxtimesOut> {
        self.gate(caller)?;
        if !self.config.options.contains(MountOptions::XTIMES)
            || !self.session.flags().contains(SessionFlags::XTIMES)
        {
            return Ok(GetxtimesOut::default());
        }
        match self.send(Opcode::Getxtimes, ino, caller, &[]) {
            Ok(reply) => {
                let (out, _) = wire::payload::<GetxtimesOut>(&reply.body)
                    .map_err(|v| self.protocol_failure(v))?;
                Ok(out)
            }
            Err(TransportError::NotSupported) => Ok(GetxtimesOut::default()),
            Err(e) => Err(e),
        }
    }

    /// SETVOLNAME; only meaningful when the server negotiated volume
    /// renames.
    pub fn setvolname(&self, caller: Caller, name: &OsStr) -> VfsResult<()> {
        self.gate(caller)?;
        if !self.session.flags().contains(SessionFlags::VOL_RENAME) {
            return Err(TransportError::NotSupported);
        }
        self.send(Opcode::Setvolname, wire::ROOT_ID, caller, &name_bytes(name))?;
        Ok(())
    }

    /// SETXATTR.
    pub fn setxattr(
        &self,
        caller: Caller,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> VfsResult<()> {
        self.gate(caller)?;
        self.xattr_gate(name)?;
        #[expect(
            clippy::cast_possible_truncation,
            reason = "xattr values are far below u32::MAX"
        )]
        let header = SetxattrIn {
            size: value.len() as u32,
            flags,
            position,
            padding: 0,
        };
        let mut payload =
            BytesMut::with_capacity(size_of::<SetxattrIn>() + name.len() + 1 + value.len());
        payload.put_slice(header.as_bytes());
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        payload.put_slice(value);
        self.send(Opcode::Setxattr, ino, caller, &payload)?;
        Ok(())
    }

    /// GETXATTR. `size == 0` probes for the required size.
    pub fn getxattr(
        &self,
        caller: Caller,
        ino: u64,
        name: &OsStr,
        size: u32,
    ) -> VfsResult<XattrReply> {
        self.gate(caller)?;
        self.xattr_gate(name)?;
        let header = GetxattrIn {
            size,
            padding: 0,
            position: 0,
            padding2: 0,
        };
        let mut payload = BytesMut::with_capacity(size_of::<GetxattrIn>() + name.len() + 1);
        payload.put_slice(header.as_bytes());
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        let reply = self.send(Opcode::Getxattr, ino, caller, &payload)?;
        if size == 0 {
            let (out, _) = wire::payload::<GetxattrOut>(&reply.body)
                .map_err(|v| self.protocol_failure(v))?;
            Ok(XattrReply::Size(out.size))
        } else {
            Ok(XattrReply::Data(reply.body))
        }
    }

    /// LISTXATTR; Apple-namespace names are filtered when the mount says
    /// so.
    pub fn listxattr(&self, caller: Caller, ino: u64, size: u32) -> VfsResult<XattrReply> {
        self.gate(caller)?;
        let header = GetxattrIn {
            size,
            padding: 0,
            position: 0,
            padding2: 0,
        };
        let reply = self.send(Opcode::Listxattr, ino, caller, header.as_bytes())?;
        if size == 0 {
            let (out, _) = wire::payload::<GetxattrOut>(&reply.body)
                .map_err(|v| self.protocol_failure(v))?;
            return Ok(XattrReply::Size(out.size));
        }
        if !self.config.options.contains(MountOptions::NO_APPLE_XATTR) {
            return Ok(XattrReply::Data(reply.body));
        }
        let mut filtered = BytesMut::with_capacity(reply.body.len());
        for name in reply.body.split(|&b| b == 0).filter(|n| !n.is_empty()) {
            if name.starts_with(APPLE_XATTR_PREFIX) {
                continue;
            }
            filtered.put_slice(name);
            filtered.put_u8(0);
        }
        Ok(XattrReply::Data(filtered.freeze()))
    }

    /// REMOVEXATTR.
    pub fn removexattr(&self, caller: Caller, ino: u64, name: &OsStr) -> VfsResult<()> {
        self.gate(caller)?;
        self.xattr_gate(name)?;
        self.send(Opcode::Removexattr, ino, caller, &name_bytes(name))?;
        Ok(())
    }

    /// GETLK.
    pub fn getlk(&self, caller: Caller, ino: u64, lk: &LkIn) -> VfsResult<LkOut> {
        self.gate(caller)?;
        let reply = self.send(Opcode::Getlk, ino, caller, lk.as_bytes())?;
        let (out, _) =
            wire::payload::<LkOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
        Ok(out)
    }

    /// SETLK / SETLKW.
    pub fn setlk(&self, caller: Caller, ino: u64, lk: &LkIn, wait: bool) -> VfsResult<()> {
        self.gate(caller)?;
        let opcode = if wait { Opcode::Setlkw } else { Opcode::Setlk };
        self.send(opcode, ino, caller, lk.as_bytes())?;
        Ok(())
    }

    /// BMAP.
    pub fn bmap(&self, caller: Caller, ino: u64, block: u64, blocksize: u32) -> VfsResult<u64> {
        self.gate(caller)?;
        let payload = BmapIn {
            block,
            blocksize,
            padding: 0,
        };
        let reply = self.send(Opcode::Bmap, ino, caller, payload.as_bytes())?;
        let (out, _) =
            wire::payload::<BmapOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
        Ok(out.block)
    }

    /// FORGET: drop lookup references. Fire-and-forget, no reply.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.attrs.invalidate(ino);
        self.names.purge_ino(ino);
        self.pages.invalidate(ino);
        notify_forget(&self.session, ino, nlookup);
    }

    /// Soft revoke: an inode we hold disappeared server-side. Purge every
    /// cache that names it and carry on; nothing panics.
    pub fn revoke(&self, ino: u64) {
        warn!(ino, "inode disappeared server-side, revoking caches");
        self.attrs.invalidate(ino);
        self.names.purge_ino(ino);
        self.pages.invalidate(ino);
    }

    fn entry_request(
        &self,
        opcode: Opcode,
        caller: Caller,
        parent: u64,
        name: &OsStr,
        header: &[u8],
    ) -> VfsResult<EntryOut> {
        let mut payload = BytesMut::with_capacity(header.len() + name.len() + 1);
        payload.put_slice(header);
        payload.put_slice(name.as_bytes());
        payload.put_u8(0);
        let reply = self.send(opcode, parent, caller, &payload)?;
        self.finish_entry(parent, name, &reply)
    }

    fn finish_entry(&self, parent: u64, name: &OsStr, reply: &Reply) -> VfsResult<EntryOut> {
        let (entry, _) =
            wire::payload::<EntryOut>(&reply.body).map_err(|v| self.protocol_failure(v))?;
        self.attrs.invalidate(parent);
        self.attrs.store(entry.attr);
        self.names.store(parent, name, entry.nodeid, entry.generation);
        Ok(entry)
    }

    fn entry_out(&self, nodeid: u64, generation: u64, attr: Attr) -> EntryOut {
        let ttl = self.config.attr_ttl;
        EntryOut {
            nodeid,
            generation,
            entry_valid: ttl.as_secs(),
            attr_valid: ttl.as_secs(),
            entry_valid_nsec: ttl.subsec_nanos(),
            attr_valid_nsec: ttl.subsec_nanos(),
            attr,
        }
    }

    fn begin_io(&self, ino: u64, wanted: AccessMode) -> Option<(AccessMode, u64)> {
        for mode in [wanted, AccessMode::ReadWrite] {
            if let Some(fh) = self.handles.io_begin(ino, mode) {
                return Some((mode, fh));
            }
        }
        None
    }

    fn any_handle(&self, ino: u64) -> Option<u64> {
        [AccessMode::Read, AccessMode::Write, AccessMode::ReadWrite]
            .into_iter()
            .find_map(|mode| self.handles.peek(ino, mode))
    }

    fn xattr_gate(&self, name: &OsStr) -> VfsResult<()> {
        if self.config.options.contains(MountOptions::NO_APPLE_XATTR)
            && name.as_bytes().starts_with(APPLE_XATTR_PREFIX)
        {
            return Err(TransportError::Errno(libc::EPERM));
        }
        Ok(())
    }

    fn begin_creating(&self, parent: u64, name: &OsStr) {
        let mut creating = self.lock_creating();
        creating.insert((parent, name.to_os_string()));
    }

    fn end_creating(&self, parent: u64, name: &OsStr) {
        let mut creating = self.lock_creating();
        creating.remove(&(parent, name.to_os_string()));
        drop(creating);
        self.created_cv.notify_all();
    }

    /// Sleep out the CREATE→OPEN window for a name being created.
    fn wait_not_creating(&self, parent: u64, name: &OsStr) {
        let key = (parent, name.to_os_string());
        let mut creating = self.lock_creating();
        while creating.contains(&key) {
            creating = match self.created_cv.wait(creating) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn lock_creating(&self) -> MutexGuard<'_, FxHashSet<(u64, OsString)>> {
        match self.creating.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

const APPLE_XATTR_PREFIX: &[u8] = b"com.apple.";

impl AvfiSink for Vfs {
    fn alter_vnode(&self, cmd: AvfiFlags, req: &AvfiRequest) -> Result<(), i32> {
        let ino = req.inode;
        let known = self.attrs.knows(ino) || self.pages.has(ino);
        if !known && !cmd.contains(AvfiFlags::MARKGONE) {
            return Err(libc::ENOENT);
        }
        if cmd.contains(AvfiFlags::MARKGONE) {
            self.revoke(ino);
        }
        if cmd.contains(AvfiFlags::UBC) {
            let ubc = UbcFlags::from_bits_truncate(req.ubc_flags);
            if ubc.intersects(UbcFlags::PUSHDIRTY | UbcFlags::PUSHALL) {
                self.pages.push(ino);
            }
            if ubc.contains(UbcFlags::INVALIDATE) {
                self.pages.invalidate(ino);
            }
        }
        if cmd.contains(AvfiFlags::UBC_SETSIZE) {
            self.attrs.update_size(ino, req.size);
            self.pages.truncate(ino, req.size);
        }
        if cmd.contains(AvfiFlags::PURGEATTRCACHE) {
            self.attrs.invalidate(ino);
        }
        if cmd.contains(AvfiFlags::PURGEVNCACHE) {
            self.names.purge_ino(ino);
        }
        if cmd.contains(AvfiFlags::KNOTE) {
            debug!(ino, note = req.note, "filesystem event note");
        }
        Ok(())
    }
}

fn name_bytes(name: &OsStr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes
}

/// Local permission check for `default_permissions` mounts.
fn check_access_bits(attr: &Attr, caller: Caller, mask: u32) -> Result<(), TransportError> {
    if mask == 0 || caller.uid == 0 {
        return Ok(());
    }
    let mode = attr.mode;
    let granted = if caller.uid == attr.uid {
        (mode >> 6) & 0o7
    } else if caller.gid == attr.gid {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    if mask & !granted != 0 {
        return Err(TransportError::Errno(libc::EACCES));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_bits_select_owner_group_other() {
        let attr = Attr {
            mode: 0o750,
            uid: 10,
            gid: 20,
            ..Attr::default()
        };
        let owner = Caller { uid: 10, gid: 20, pid: 1 };
        let group = Caller { uid: 11, gid: 20, pid: 1 };
        let other = Caller { uid: 12, gid: 21, pid: 1 };
        assert!(check_access_bits(&attr, owner, 0o7).is_ok());
        assert!(check_access_bits(&attr, group, 0o5).is_ok());
        assert!(check_access_bits(&attr, group, 0o2).is_err());
        assert!(check_access_bits(&attr, other, 0o4).is_err());
        // Root passes everything.
        let root = Caller { uid: 0, gid: 0, pid: 1 };
        assert!(check_access_bits(&attr, root, 0o7).is_ok());
    }
}
