//! Minimal unified-buffer-cache model.
//!
//! Cached file pages must never shadow server-side content changes, so the
//! adapter pushes and invalidates around size-changing SETATTR and around
//! EXCHANGE. Pages are written through on WRITE; `push` therefore has
//! nothing to send and only exists as the ordering point the coherence
//! rules name.

use std::sync::{Mutex, MutexGuard};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Cache page size in bytes.
pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Default)]
struct FilePages {
    pages: Mutex<FxHashMap<u64, Bytes>>,
}

impl FilePages {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<u64, Bytes>> {
        match self.pages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-inode cached pages. Disabled entirely for `direct_io` / `no_ubc`
/// mounts.
#[derive(Debug)]
pub struct PageCache {
    files: scc::HashMap<u64, FilePages>,
    enabled: bool,
}

impl PageCache {
    /// A cache; `enabled` is false for `direct_io` / `no_ubc` mounts.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            files: scc::HashMap::new(),
            enabled,
        }
    }

    /// Serve a read entirely from cache, or `None` on any gap.
    #[must_use]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "in-page offsets are below PAGE_SIZE"
    )]
    pub fn read(&self, ino: u64, offset: u64, len: usize) -> Option<Bytes> {
        if !self.enabled || len == 0 {
            return None;
        }
        self.files.read(&ino, |_, file| {
            let pages = file.lock();
            let mut out = BytesMut::with_capacity(len);
            let mut pos = offset;
            let end = offset + len as u64;
            while pos < end {
                let index = pos / PAGE_SIZE;
                let page = pages.get(&index)?;
                let start = (pos - index * PAGE_SIZE) as usize;
                let want = ((end - pos) as usize).min(PAGE_SIZE as usize - start);
                if page.len() < start + want {
                    return None;
                }
                out.put_slice(&page[start..start + want]);
                pos += want as u64;
            }
            Some(out.freeze())
        })?
    }

    /// Store bytes observed at `offset`. Only page-aligned coverage is
    /// kept; a misaligned head or an unaligned partial overlap is skipped
    /// rather than merged, which keeps the cache a strict subset of what
    /// the server returned.
    pub fn store(&self, ino: u64, offset: u64, data: &Bytes) {
        if !self.enabled || data.is_empty() {
            return;
        }
        let _ = self.files.insert(ino, FilePages::default());
        self.files.read(&ino, |_, file| {
            let mut pages = file.lock();
            let mut pos = offset;
            let end = offset + data.len() as u64;
            while pos < end {
                let index = pos / PAGE_SIZE;
                if pos != index * PAGE_SIZE {
                    // Skip to the next page boundary.
                    pos = (index + 1) * PAGE_SIZE;
                    continue;
                }
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "slice bounds are at most PAGE_SIZE"
                )]
                let take = ((end - pos) as usize).min(PAGE_SIZE as usize);
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "pos - offset is bounded by data.len()"
                )]
                let from = (pos - offset) as usize;
                pages.insert(index, data.slice(from..from + take));
                pos += take as u64;
            }
        });
    }

    /// Push dirty pages toward the server.
    ///
    /// Writes go through synchronously, so there is never anything dirty to
    /// send; a failure here would be logged and the operation continued.
    pub fn push(&self, ino: u64) {
        if self.enabled {
            debug!(ino, "pushing cached pages");
        }
    }

    /// Drop every cached page of an inode.
    pub fn invalidate(&self, ino: u64) {
        self.files.remove(&ino);
    }

    /// Drop pages past a new end-of-file and trim the page straddling it.
    pub fn truncate(&self, ino: u64, size: u64) {
        if !self.enabled {
            return;
        }
        self.files.read(&ino, |_, file| {
            let mut pages = file.lock();
            let last = size / PAGE_SIZE;
            pages.retain(|&index, _| index <= last);
            if let Some(page) = pages.get_mut(&last) {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "in-page length is below PAGE_SIZE"
                )]
                let keep = (size - last * PAGE_SIZE) as usize;
                if page.len() > keep {
                    *page = page.slice(..keep);
                }
            }
        });
    }

    /// Whether any page of the inode is cached.
    #[must_use]
    pub fn has(&self, ino: u64) -> bool {
        self.files
            .read(&ino, |_, file| !file.lock().is_empty())
            .unwrap_or(false)
    }
}
