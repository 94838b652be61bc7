//! User-space FUSE runtime.
//!
//! Pairs with the `fusegate` transport: a [`NodeTable`] maps the opaque
//! nodeids the transport speaks to hierarchical paths, an [`FsServer`]
//! drives a channel of framed requests against a user-provided [`PathFs`],
//! and hidden deletion preserves open-unlink semantics on backing stores
//! that cannot keep unlinked-but-open files.

/// Channel implementation over a transport device handle.
pub mod chan;
/// The path-based filesystem contract.
pub mod fs;
mod hidden;
/// The inode/path table.
pub mod nodes;
/// The session serve loop.
pub mod serve;

pub use fs::{FileInfo, FileStat, FsContext, FsResult, FsStats, PathFs, ReaddirEntry, TimeSpec};
pub use nodes::{NodeError, NodeInfo, NodeRef, NodeTable};
pub use serve::{Channel, ChannelError, FsServer, ServeConfig, ServeError};
