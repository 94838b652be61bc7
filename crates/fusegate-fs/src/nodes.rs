//! The inode/path table.
//!
//! Converts between the opaque nodeids the transport uses and the
//! hierarchical pathnames a backing filesystem consumes. Nodes live in an
//! arena addressed by stable indexes; children hold their parent's index,
//! and two hash indexes, by nodeid and by (parent, name), hang off the
//! arena. A single mutex covers the whole structure.
//!
//! A non-root node with a nonzero lookup count is always reachable via its
//! parent/name chain up to the root (nodeid 1); the root itself is never
//! evicted.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use fusegate::wire::{ROOT_ID, UNKNOWN_INO};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, error};

/// Longest path the table will materialise.
const MAX_PATH: usize = 4096;

/// Errors from table operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    /// The nodeid names no live node.
    #[error("unknown node")]
    NotFound,
    /// An ancestor was concurrently unhashed; the path no longer resolves.
    #[error("node unreachable from root")]
    Unreachable,
    /// A colliding node appeared under the target name mid-operation.
    #[error("target name busy")]
    Busy,
    /// The assembled path exceeds the supported maximum.
    #[error("path too long")]
    PathTooLong,
}

impl From<NodeError> for i32 {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::NotFound | NodeError::Unreachable => libc::ENOENT,
            NodeError::Busy => libc::EBUSY,
            NodeError::PathTooLong => libc::ENAMETOOLONG,
        }
    }
}

/// A byte-range lock remembered against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    /// Lock owner token.
    pub owner: u64,
    /// First byte.
    pub start: u64,
    /// Last byte.
    pub end: u64,
    /// `F_RDLCK` or `F_WRLCK`.
    pub typ: i32,
}

/// A resolved node reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef {
    /// The node's id.
    pub nodeid: u64,
    /// Generation paired with the id.
    pub generation: u64,
}

/// Observable node state, for callers that need more than the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node's id.
    pub nodeid: u64,
    /// Generation paired with the id.
    pub generation: u64,
    /// Outstanding lookup references held by the transport.
    pub nlookup: u64,
    /// Open file handles on the node.
    pub open_count: u32,
    /// Whether the node was renamed aside while still open.
    pub hidden: bool,
}

#[derive(Debug)]
struct Node {
    nodeid: u64,
    generation: u64,
    parent: Option<usize>,
    name: Option<OsString>,
    nlookup: u64,
    refctr: u32,
    open_count: u32,
    hidden: bool,
    cached_mtime: Option<(i64, u32)>,
    cached_size: u64,
    locks: Vec<LockRange>,
}

impl Node {
    fn new(nodeid: u64, generation: u64) -> Self {
        Self {
            nodeid,
            generation,
            parent: None,
            name: None,
            nlookup: 0,
            refctr: 1,
            open_count: 0,
            hidden: false,
            cached_mtime: None,
            cached_size: 0,
            locks: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    arena: Vec<Option<Node>>,
    free: Vec<usize>,
    by_id: FxHashMap<u64, usize>,
    by_name: FxHashMap<(u64, OsString), usize>,
    ctr: u64,
    generation: u64,
    hidectr: u32,
}

/// The table of live nodes.
#[derive(Debug)]
pub struct NodeTable {
    inner: Mutex<Tables>,
    case_insensitive: bool,
}

impl NodeTable {
    /// An empty table holding only the root node.
    #[must_use]
    pub fn new(case_insensitive: bool) -> Self {
        let mut tables = Tables::default();
        let mut root = Node::new(ROOT_ID, 0);
        root.name = Some(OsString::from("/"));
        root.nlookup = 1;
        tables.arena.push(Some(root));
        tables.by_id.insert(ROOT_ID, 0);
        tables.ctr = ROOT_ID;
        Self {
            inner: Mutex::new(tables),
            case_insensitive,
        }
    }

    /// Whether name keys fold case.
    #[must_use]
    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    fn key(&self, parent: u64, name: &OsStr) -> (u64, OsString) {
        if self.case_insensitive
            && let Some(s) = name.to_str()
        {
            return (parent, OsString::from(s.to_lowercase()));
        }
        (parent, name.to_os_string())
    }

    /// Find or create the child `name` of `parent`, taking one lookup
    /// reference either way.
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<NodeRef, NodeError> {
        let key = self.key(parent, name);
        let mut t = self.lock();
        if let Some(&idx) = t.by_name.get(&key) {
            let node = slot_mut(&mut t, idx)?;
            node.nlookup += 1;
            return Ok(NodeRef {
                nodeid: node.nodeid,
                generation: node.generation,
            });
        }

        let parent_idx = *t.by_id.get(&parent).ok_or(NodeError::NotFound)?;
        let nodeid = next_id(&mut t);
        let generation = t.generation;
        let idx = match t.free.pop() {
            Some(idx) => idx,
            None => {
                t.arena.push(None);
                t.arena.len() - 1
            }
        };
        let mut node = Node::new(nodeid, generation);
        node.nlookup = 1;
        node.parent = Some(parent_idx);
        node.name = Some(name.to_os_string());
        t.arena[idx] = Some(node);
        t.by_id.insert(nodeid, idx);
        t.by_name.insert(key, idx);
        if let Ok(parent) = slot_mut(&mut t, parent_idx) {
            parent.refctr += 1;
        }
        Ok(NodeRef {
            nodeid,
            generation,
        })
    }

    /// Resolve a name without creating or referencing anything.
    #[must_use]
    pub fn peek(&self, parent: u64, name: &OsStr) -> Option<NodeRef> {
        let key = self.key(parent, name);
        let t = self.lock();
        let idx = *t.by_name.get(&key)?;
        let node = t.arena.get(idx)?.as_ref()?;
        Some(NodeRef {
            nodeid: node.nodeid,
            generation: node.generation,
        })
    }

    /// Observable state of a node.
    #[must_use]
    pub fn info(&self, nodeid: u64) -> Option<NodeInfo> {
        let t = self.lock();
        let idx = *t.by_id.get(&nodeid)?;
        let node = t.arena.get(idx)?.as_ref()?;
        Some(NodeInfo {
            nodeid: node.nodeid,
            generation: node.generation,
            nlookup: node.nlookup,
            open_count: node.open_count,
            hidden: node.hidden,
        })
    }

    /// Drop `nlookup` lookup references. At zero the node leaves the name
    /// index (its pathname stops resolving) and, once nothing else
    /// references it, the id index too. The root is exempt.
    pub fn forget(&self, nodeid: u64, nlookup: u64) {
        if nodeid == ROOT_ID {
            return;
        }
        let mut t = self.lock();
        let Some(&idx) = t.by_id.get(&nodeid) else {
            return;
        };
        let Ok(node) = slot_mut(&mut t, idx) else {
            return;
        };
        node.nlookup = node.nlookup.saturating_sub(nlookup);
        if node.nlookup == 0 {
            unhash_name(self, &mut t, idx);
            unref(&mut t, idx);
        }
    }

    /// Build the absolute path of a node, rootward.
    pub fn path_of(&self, nodeid: u64) -> Result<PathBuf, NodeError> {
        self.path_of_name(nodeid, None)
    }

    /// Build the absolute path of `name` inside the directory `nodeid`.
    pub fn path_of_name(
        &self,
        nodeid: u64,
        name: Option<&OsStr>,
    ) -> Result<PathBuf, NodeError> {
        let t = self.lock();
        let mut components: Vec<OsString> = Vec::new();
        let mut total = 0_usize;
        if let Some(name) = name {
            total += name.len() + 1;
            components.push(name.to_os_string());
        }

        let mut idx = *t.by_id.get(&nodeid).ok_or(NodeError::NotFound)?;
        loop {
            let node = t
                .arena
                .get(idx)
                .and_then(Option::as_ref)
                .ok_or(NodeError::NotFound)?;
            if node.nodeid == ROOT_ID {
                break;
            }
            let name = node.name.as_ref().ok_or(NodeError::Unreachable)?;
            total += name.len() + 1;
            if total > MAX_PATH {
                return Err(NodeError::PathTooLong);
            }
            components.push(name.clone());
            idx = node.parent.ok_or(NodeError::Unreachable)?;
        }
        drop(t);

        let mut path = PathBuf::from("/");
        for component in components.iter().rev() {
            path.push(component);
        }
        Ok(path)
    }

    /// Unhash a name after a successful unlink/rmdir.
    pub fn remove_name(&self, parent: u64, name: &OsStr) {
        let key = self.key(parent, name);
        let mut t = self.lock();
        if let Some(&idx) = t.by_name.get(&key) {
            unhash_name(self, &mut t, idx);
        }
    }

    /// Atomically move a node to a new key.
    ///
    /// An existing node under the target key is unhashed first, unless
    /// `hide` is set, in which case a concurrent occupant is a collision
    /// and the rename fails busy. With `hide`, the moved node is marked
    /// hidden so open handles can keep using it.
    pub fn rename(
        &self,
        olddir: u64,
        oldname: &OsStr,
        newdir: u64,
        newname: &OsStr,
        hide: bool,
    ) -> Result<(), NodeError> {
        let old_key = self.key(olddir, oldname);
        let new_key = self.key(newdir, newname);
        let mut t = self.lock();
        let Some(&idx) = t.by_name.get(&old_key) else {
            return Ok(());
        };
        if let Some(&existing) = t.by_name.get(&new_key) {
            if hide {
                error!("hidden file got created during hiding");
                return Err(NodeError::Busy);
            }
            unhash_name(self, &mut t, existing);
        }
        unhash_name(self, &mut t, idx);

        let new_parent_idx = *t.by_id.get(&newdir).ok_or(NodeError::NotFound)?;
        {
            let node = slot_mut(&mut t, idx)?;
            node.parent = Some(new_parent_idx);
            node.name = Some(newname.to_os_string());
            if hide {
                node.hidden = true;
            }
        }
        t.by_name.insert(new_key, idx);
        if let Ok(parent) = slot_mut(&mut t, new_parent_idx) {
            parent.refctr += 1;
        }
        Ok(())
    }

    /// Swap the table positions of two names after a successful EXCHANGE,
    /// along with their cached stat state.
    pub fn exchange(
        &self,
        dir1: u64,
        name1: &OsStr,
        dir2: u64,
        name2: &OsStr,
    ) -> Result<(), NodeError> {
        let key1 = self.key(dir1, name1);
        let key2 = self.key(dir2, name2);
        let mut t = self.lock();
        let idx1 = t.by_name.get(&key1).copied().ok_or(NodeError::NotFound)?;
        let idx2 = t.by_name.get(&key2).copied().ok_or(NodeError::NotFound)?;
        t.by_name.insert(key1, idx2);
        t.by_name.insert(key2, idx1);

        let (p1, n1) = {
            let node = slot_mut(&mut t, idx1)?;
            (node.parent, node.name.clone())
        };
        let (p2, n2) = {
            let node = slot_mut(&mut t, idx2)?;
            let swapped = (node.parent, node.name.clone());
            node.parent = p1;
            node.name = n1;
            swapped
        };
        {
            let node = slot_mut(&mut t, idx1)?;
            node.parent = p2;
            node.name = n2;
        }
        Ok(())
    }

    /// Count an open handle against a node.
    pub fn open_inc(&self, nodeid: u64) {
        let mut t = self.lock();
        if let Some(&idx) = t.by_id.get(&nodeid)
            && let Ok(node) = slot_mut(&mut t, idx)
        {
            node.open_count += 1;
        }
    }

    /// Drop an open handle. Returns the remaining open count and whether
    /// the node is hidden, which the caller uses to schedule the deferred
    /// unlink on the last close.
    pub fn open_dec(&self, nodeid: u64) -> (u32, bool) {
        let mut t = self.lock();
        if let Some(&idx) = t.by_id.get(&nodeid)
            && let Ok(node) = slot_mut(&mut t, idx)
        {
            node.open_count = node.open_count.saturating_sub(1);
            return (node.open_count, node.hidden);
        }
        (0, false)
    }

    /// Whether the name currently resolves to a node with open handles.
    #[must_use]
    pub fn is_open(&self, dir: u64, name: &OsStr) -> bool {
        let key = self.key(dir, name);
        let t = self.lock();
        t.by_name
            .get(&key)
            .and_then(|&idx| t.arena.get(idx))
            .and_then(Option::as_ref)
            .is_some_and(|node| node.open_count > 0)
    }

    /// Advance the hidden-name counter.
    #[must_use]
    pub fn next_hidectr(&self) -> u32 {
        let mut t = self.lock();
        t.hidectr = t.hidectr.wrapping_add(1);
        t.hidectr
    }

    /// Remember the last observed stat, for open-time content comparison.
    pub fn set_cached_stat(&self, nodeid: u64, mtime: (i64, u32), size: u64) {
        let mut t = self.lock();
        if let Some(&idx) = t.by_id.get(&nodeid)
            && let Ok(node) = slot_mut(&mut t, idx)
        {
            node.cached_mtime = Some(mtime);
            node.cached_size = size;
        }
    }

    /// The cached stat recorded by [`set_cached_stat`](Self::set_cached_stat).
    #[must_use]
    pub fn cached_stat(&self, nodeid: u64) -> Option<((i64, u32), u64)> {
        let t = self.lock();
        let idx = *t.by_id.get(&nodeid)?;
        let node = t.arena.get(idx)?.as_ref()?;
        Some((node.cached_mtime?, node.cached_size))
    }

    /// Remember a granted byte-range lock.
    pub fn record_lock(&self, nodeid: u64, lock: LockRange) {
        let mut t = self.lock();
        if let Some(&idx) = t.by_id.get(&nodeid)
            && let Ok(node) = slot_mut(&mut t, idx)
        {
            node.locks.retain(|l| {
                l.owner != lock.owner || l.start != lock.start || l.end != lock.end
            });
            if lock.typ != libc::F_UNLCK {
                node.locks.push(lock);
            }
        }
    }

    /// Drop and return every lock held by `owner` on the node.
    pub fn take_locks(&self, nodeid: u64, owner: u64) -> Vec<LockRange> {
        let mut t = self.lock();
        let Some(&idx) = t.by_id.get(&nodeid) else {
            return Vec::new();
        };
        let Ok(node) = slot_mut(&mut t, idx) else {
            return Vec::new();
        };
        let (taken, kept) = node.locks.drain(..).partition(|l| l.owner == owner);
        node.locks = kept;
        taken
    }

    /// Number of live nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    /// Whether only the root exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn slot_mut(t: &mut Tables, idx: usize) -> Result<&mut Node, NodeError> {
    t.arena
        .get_mut(idx)
        .and_then(Option::as_mut)
        .ok_or(NodeError::NotFound)
}

/// Allocate the next nodeid: 32-bit wrapping counter that skips zero and
/// the unknown-inode sentinel, bumping the generation each time it wraps.
fn next_id(t: &mut Tables) -> u64 {
    loop {
        t.ctr = (t.ctr + 1) & 0xffff_ffff;
        if t.ctr == 0 {
            t.generation += 1;
        }
        if t.ctr != 0 && t.ctr != UNKNOWN_INO && !t.by_id.contains_key(&t.ctr) {
            return t.ctr;
        }
    }
}

/// Remove a node from the name index: its pathname stops resolving and its
/// parent loses one reference.
fn unhash_name(table: &NodeTable, t: &mut Tables, idx: usize) {
    let (parent_idx, key) = {
        let Some(node) = t.arena.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        let Some(name) = node.name.take() else {
            return;
        };
        let Some(parent_idx) = node.parent.take() else {
            node.name = Some(name);
            return;
        };
        let parent_id = t
            .arena
            .get(parent_idx)
            .and_then(Option::as_ref)
            .map_or(0, |p| p.nodeid);
        (parent_idx, table.key(parent_id, &name))
    };
    if t.by_name.get(&key) == Some(&idx) {
        t.by_name.remove(&key);
    }
    unref(t, parent_idx);
}

/// Drop one structural reference; at zero the node leaves the id index and
/// its arena slot is recycled.
fn unref(t: &mut Tables, idx: usize) {
    let Some(node) = t.arena.get_mut(idx).and_then(Option::as_mut) else {
        return;
    };
    node.refctr = node.refctr.saturating_sub(1);
    if node.refctr > 0 {
        return;
    }
    let nodeid = node.nodeid;
    debug!(nodeid, "deleting node");
    t.arena[idx] = None;
    t.by_id.remove(&nodeid);
    t.free.push(idx);
}
