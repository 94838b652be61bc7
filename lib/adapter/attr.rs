//! Attribute and name caches with validity deadlines.

use std::ffi::{OsStr, OsString};
use std::time::{Duration, Instant};

use crate::wire::Attr;

#[derive(Debug, Clone)]
struct AttrEntry {
    attr: Attr,
    valid_until: Instant,
}

/// Per-inode cache of the last-observed attributes.
///
/// An entry past its deadline is stale and ignored. A disabled cache
/// (`no_attrcache`) stores nothing, so every GETATTR goes on the wire.
#[derive(Debug)]
pub struct AttrCache {
    map: scc::HashMap<u64, AttrEntry>,
    ttl: Duration,
    enabled: bool,
}

impl AttrCache {
    /// A cache whose entries stay fresh for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, enabled: bool) -> Self {
        Self {
            map: scc::HashMap::new(),
            ttl,
            enabled,
        }
    }

    /// The cached attributes, if present and fresh.
    #[must_use]
    pub fn fresh(&self, ino: u64) -> Option<Attr> {
        if !self.enabled {
            return None;
        }
        self.map.read(&ino, |_, e| {
            (e.valid_until > Instant::now()).then_some(e.attr)
        })?
    }

    /// The cached size, fresh or stale. Used for read clipping, where a
    /// stale size only costs an extra round trip.
    #[must_use]
    pub fn cached_size(&self, ino: u64) -> Option<u64> {
        self.map.read(&ino, |_, e| e.attr.size)
    }

    /// The cached (mtime, size) pair, fresh or stale; `auto_cache` compares
    /// these across OPEN.
    #[must_use]
    pub fn cached_mtime_size(&self, ino: u64) -> Option<(i64, u32, u64)> {
        self.map
            .read(&ino, |_, e| (e.attr.mtime, e.attr.mtimensec, e.attr.size))
    }

    /// Record freshly observed attributes.
    pub fn store(&self, attr: Attr) {
        if !self.enabled {
            return;
        }
        let entry = AttrEntry {
            attr,
            valid_until: Instant::now() + self.ttl,
        };
        self.map.upsert(attr.ino, entry);
    }

    /// Drop the entry for one inode.
    pub fn invalidate(&self, ino: u64) {
        self.map.remove(&ino);
    }

    /// Adjust only the cached size, keeping the deadline.
    pub fn update_size(&self, ino: u64, size: u64) {
        self.map.update(&ino, |_, e| e.attr.size = size);
    }

    /// Whether the cache knows this inode at all.
    #[must_use]
    pub fn knows(&self, ino: u64) -> bool {
        self.map.read(&ino, |_, _| ()).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NameEntry {
    Found { ino: u64, generation: u64 },
    Negative,
}

/// Name cache mapping `(parent, name)` to a child inode, with optional
/// negative entries.
#[derive(Debug)]
pub struct NameCache {
    map: scc::HashMap<(u64, OsString), NameEntry>,
    enabled: bool,
    negative: bool,
}

/// Result of a name-cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameHit {
    /// The child is known.
    Found {
        /// Child inode.
        ino: u64,
        /// Generation paired with the inode.
        generation: u64,
    },
    /// The name is known not to exist.
    Negative,
    /// The cache has no opinion.
    Miss,
}

impl NameCache {
    /// A name cache; `enabled` is `!no_vncache`, `negative` enables
    /// negative entries.
    #[must_use]
    pub fn new(enabled: bool, negative: bool) -> Self {
        Self {
            map: scc::HashMap::new(),
            enabled,
            negative,
        }
    }

    /// Probe for a child.
    #[must_use]
    pub fn lookup(&self, parent: u64, name: &OsStr) -> NameHit {
        if !self.enabled {
            return NameHit::Miss;
        }
        let key = (parent, name.to_os_string());
        match self.map.read(&key, |_, e| e.clone()) {
            Some(NameEntry::Found { ino, generation }) => NameHit::Found { ino, generation },
            Some(NameEntry::Negative) => NameHit::Negative,
            None => NameHit::Miss,
        }
    }

    /// Record a resolved child.
    pub fn store(&self, parent: u64, name: &OsStr, ino: u64, generation: u64) {
        if !self.enabled {
            return;
        }
        self.map.upsert(
            (parent, name.to_os_string()),
            NameEntry::Found { ino, generation },
        );
    }

    /// Record that a name does not exist, if negative caching is on.
    pub fn store_negative(&self, parent: u64, name: &OsStr) {
        if !self.enabled || !self.negative {
            return;
        }
        self.map
            .upsert((parent, name.to_os_string()), NameEntry::Negative);
    }

    /// Drop one entry.
    pub fn purge(&self, parent: u64, name: &OsStr) {
        self.map.remove(&(parent, name.to_os_string()));
    }

    /// Drop every entry resolving to `ino`.
    pub fn purge_ino(&self, ino: u64) {
        self.map
            .retain(|_, e| !matches!(e, NameEntry::Found { ino: i, .. } if *i == ino));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(ino: u64, size: u64) -> Attr {
        Attr {
            ino,
            size,
            ..Attr::default()
        }
    }

    #[test]
    fn fresh_entry_expires() {
        let cache = AttrCache::new(Duration::from_millis(20), true);
        cache.store(attr(2, 5));
        assert_eq!(cache.fresh(2).map(|a| a.size), Some(5));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.fresh(2).is_none());
        // Stale size remains available for clipping.
        assert_eq!(cache.cached_size(2), Some(5));
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = AttrCache::new(Duration::from_secs(60), false);
        cache.store(attr(2, 5));
        assert!(cache.fresh(2).is_none());
        assert!(!cache.knows(2));
    }

    #[test]
    fn negative_entries_only_when_enabled() {
        let with = NameCache::new(true, true);
        with.store_negative(1, OsStr::new("gone"));
        assert_eq!(with.lookup(1, OsStr::new("gone")), NameHit::Negative);

        let without = NameCache::new(true, false);
        without.store_negative(1, OsStr::new("gone"));
        assert_eq!(without.lookup(1, OsStr::new("gone")), NameHit::Miss);
    }

    #[test]
    fn purge_ino_removes_aliases() {
        let names = NameCache::new(true, false);
        names.store(1, OsStr::new("a"), 7, 0);
        names.store(1, OsStr::new("b"), 7, 0);
        names.store(1, OsStr::new("c"), 8, 0);
        names.purge_ino(7);
        assert_eq!(names.lookup(1, OsStr::new("a")), NameHit::Miss);
        assert_eq!(names.lookup(1, OsStr::new("b")), NameHit::Miss);
        assert!(matches!(
            names.lookup(1, OsStr::new("c")),
            NameHit::Found { ino: 8, .. }
        ));
    }
}
