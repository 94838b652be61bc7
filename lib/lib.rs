//! FUSE request/response transport.
//!
//! The "kernel half" of a FUSE implementation as an in-process library: a
//! VFS adapter translates filesystem operations into framed requests, a
//! dispatcher multiplexes them over a per-mount session, and a
//! character-device-shaped endpoint hands them to a server and matches its
//! replies back to the blocked callers. The server side of the protocol
//! lives in the companion `fusegate-fs` crate.

/// VFS adapter: caches, file handles, page coherence.
pub mod adapter;
/// Device endpoint slots: open/close/read/write/ioctl/poll.
pub mod device;
/// The request dispatcher and cancellation.
pub mod dispatch;
/// Error taxonomy.
pub mod error;
/// Per-mount session state.
pub mod session;
/// In-flight request tickets.
pub mod ticket;
/// Wire codec.
pub mod wire;

pub use adapter::{MountConfig, MountOptions, Vfs};
pub use device::{DeviceHandle, DeviceTable, Ioctl, IoctlReply};
pub use dispatch::{CancelToken, Request, dispatch};
pub use error::{EndpointError, ProtocolViolation, TransportError};
pub use session::{Session, SessionConfig};
pub use ticket::{Reply, Ticket};
