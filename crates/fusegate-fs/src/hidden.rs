//! Hidden deletion: rename-on-open-delete.
//!
//! When a path is unlinked while its node still has open handles, the file
//! is renamed to a generated `.fuse_hiddenXXXXXXXXXXXXXXXX` name in the
//! same directory instead, and the node is marked hidden. The real unlink
//! happens on the last release. This preserves POSIX open-unlink behaviour
//! on backing filesystems that cannot keep a file with no link.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fs::{FsContext, PathFs};
use crate::nodes::NodeTable;

/// Probe attempts before giving up with `EBUSY`.
const HIDE_ATTEMPTS: u32 = 10;

/// Pick an unused hidden name for `oldname` inside `dir`.
///
/// Candidates combine the node's id with a table-wide counter; each is
/// checked against the node table and then against the backing filesystem,
/// which must report it absent.
fn hidden_name<F: PathFs>(
    fs: &F,
    nodes: &NodeTable,
    ctx: &FsContext,
    dir: u64,
    oldname: &OsStr,
) -> Result<(PathBuf, OsString), i32> {
    let node = nodes.peek(dir, oldname).ok_or(libc::ENOENT)?;
    for _ in 0..HIDE_ATTEMPTS {
        let newname = loop {
            let ctr = nodes.next_hidectr();
            let candidate =
                OsString::from(format!(".fuse_hidden{:08x}{:08x}", node.nodeid, ctr));
            if nodes.peek(dir, &candidate).is_none() {
                break candidate;
            }
        };
        let newpath = nodes
            .path_of_name(dir, Some(&newname))
            .map_err(i32::from)?;
        match fs.getattr(ctx, &newpath) {
            Err(errno) if errno == libc::ENOENT => return Ok((newpath, newname)),
            Err(errno) => return Err(errno),
            Ok(_) => {} // Name exists on the backing store; try another.
        }
    }
    Err(libc::EBUSY)
}

/// Rename `oldname` aside and mark its node hidden.
pub(crate) fn hide_node<F: PathFs>(
    fs: &F,
    nodes: &NodeTable,
    ctx: &FsContext,
    oldpath: &Path,
    dir: u64,
    oldname: &OsStr,
) -> Result<(), i32> {
    let (newpath, newname) = hidden_name(fs, nodes, ctx, dir, oldname)?;
    debug!(?oldpath, ?newpath, "hiding open file");
    fs.rename(ctx, oldpath, &newpath)?;
    nodes
        .rename(dir, oldname, dir, &newname, true)
        .map_err(i32::from)
}
