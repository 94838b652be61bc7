//! Per-inode file-handle table.
//!
//! The adapter retains at most one server handle per (inode, access-mode)
//! slot, reference counted across concurrent opens. RELEASE is issued only
//! on the last close, and only once every in-flight READ/WRITE on the
//! handle has finished.

use std::sync::{Condvar, Mutex, MutexGuard};

use rustc_hash::FxHashMap;

/// The access mode a handle was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read-only.
    Read,
    /// Write-only.
    Write,
    /// Read-write.
    ReadWrite,
}

impl AccessMode {
    /// Derive the mode from `open(2)` flags.
    #[must_use]
    #[expect(clippy::cast_sign_loss, reason = "O_ACCMODE constants are small positives")]
    pub fn from_flags(flags: u32) -> Self {
        match flags & (libc::O_ACCMODE as u32) {
            f if f == libc::O_WRONLY as u32 => Self::Write,
            f if f == libc::O_RDWR as u32 => Self::ReadWrite,
            _ => Self::Read,
        }
    }
}

#[derive(Debug)]
struct HandleEntry {
    fh: u64,
    opens: u32,
    inflight: u32,
}

/// The table of open server handles.
#[derive(Debug, Default)]
pub struct HandleTable {
    inner: Mutex<FxHashMap<(u64, AccessMode), HandleEntry>>,
    idle: Condvar,
}

impl HandleTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing handle for this (inode, mode), bumping its open
    /// count, or return `None` so the caller issues OPEN on the wire.
    #[must_use]
    pub fn retain(&self, ino: u64, mode: AccessMode) -> Option<u64> {
        let mut map = self.lock();
        let entry = map.get_mut(&(ino, mode))?;
        entry.opens += 1;
        Some(entry.fh)
    }

    /// Register a handle freshly returned by the server, with one open.
    pub fn register(&self, ino: u64, mode: AccessMode, fh: u64) {
        let mut map = self.lock();
        map.insert((ino, mode), HandleEntry {
            fh,
            opens: 1,
            inflight: 0,
        });
    }

    /// Begin an I/O against the handle, pinning it against RELEASE.
    /// Returns the handle value, or `None` if no handle is registered.
    #[must_use]
    pub fn io_begin(&self, ino: u64, mode: AccessMode) -> Option<u64> {
        let mut map = self.lock();
        let entry = map.get_mut(&(ino, mode))?;
        entry.inflight += 1;
        Some(entry.fh)
    }

    /// End an I/O begun with [`io_begin`](Self::io_begin).
    pub fn io_end(&self, ino: u64, mode: AccessMode) {
        let mut map = self.lock();
        if let Some(entry) = map.get_mut(&(ino, mode)) {
            entry.inflight = entry.inflight.saturating_sub(1);
        }
        drop(map);
        self.idle.notify_all();
    }

    /// Drop one open. On the last one, waits for in-flight I/O to drain,
    /// removes the slot, and returns the handle the caller must RELEASE.
    #[must_use]
    pub fn close(&self, ino: u64, mode: AccessMode) -> Option<u64> {
        let mut map = self.lock();
        let entry = map.get_mut(&(ino, mode))?;
        if entry.opens > 1 {
            entry.opens -= 1;
            return None;
        }
        while map
            .get(&(ino, mode))
            .is_some_and(|e| e.inflight > 0)
        {
            map = match self.idle.wait(map) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        map.remove(&(ino, mode)).map(|e| e.fh)
    }

    /// Total opens across all modes for an inode.
    #[must_use]
    pub fn open_count(&self, ino: u64) -> u32 {
        let map = self.lock();
        map.iter()
            .filter(|((i, _), _)| *i == ino)
            .map(|(_, e)| e.opens)
            .sum()
    }

    /// The registered handle for a mode, if any, without retaining it.
    #[must_use]
    pub fn peek(&self, ino: u64, mode: AccessMode) -> Option<u64> {
        self.lock().get(&(ino, mode)).map(|e| e.fh)
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<(u64, AccessMode), HandleEntry>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
