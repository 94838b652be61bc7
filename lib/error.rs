//! Error taxonomy for the transport.
//!
//! Every failure mode is a structured error; nothing panics. Transport and
//! protocol errors bubble to the original caller unchanged, unsupported
//! errors are recovered at the adapter layer when a sensible default exists,
//! and semantic errors from the backing filesystem pass through verbatim as
//! [`TransportError::Errno`].

use thiserror::Error;

/// A malformed message detected by the device endpoint or a decoder.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The reply was shorter than the fixed reply header.
    #[error("reply shorter than header")]
    HeaderTooShort,
    /// The message body length disagrees with the length field in the header.
    #[error("message body size does not match that in the header")]
    LengthMismatch,
    /// A reply carried both a nonzero error and a message body.
    #[error("non-zero error for a message with a body")]
    BodyWithError,
    /// A reply body was too short for the payload its opcode declares.
    #[error("reply body too short for opcode")]
    BodyTooShort,
    /// The peer sent an opcode this implementation does not know.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
}

/// Errors surfaced by [`dispatch`](crate::dispatch::dispatch) and by the
/// adapter operations built on top of it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The session died: the device was closed, the server crashed, or a
    /// kill ioctl was issued. Never retried.
    #[error("connection lost")]
    ConnectionLost,
    /// The server returned "function not implemented" for this opcode; the
    /// result is sticky for the life of the session.
    #[error("operation not supported by the server")]
    NotSupported,
    /// The waiting caller was cancelled and an INTERRUPT was forwarded.
    #[error("interrupted")]
    Interrupted,
    /// The reply violated the wire protocol. Kills the session.
    #[error("protocol violation: {0}")]
    Protocol(ProtocolViolation),
    /// A semantic error from the backing filesystem, passed through
    /// unchanged as a positive errno value.
    #[error("server replied errno {0}")]
    Errno(i32),
    /// Allocation failure while building a request. Not retried.
    #[error("out of memory")]
    OutOfMemory,
}

impl TransportError {
    /// Wrap a positive errno from a reply, folding the special values the
    /// dispatcher gives their own variants.
    #[must_use]
    pub fn from_reply_errno(errno: i32) -> Self {
        match errno {
            libc::ENOTCONN | libc::ENODEV => Self::ConnectionLost,
            libc::ENOMEM => Self::OutOfMemory,
            e => Self::Errno(e),
        }
    }
}

impl From<TransportError> for i32 {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectionLost => libc::ENOTCONN,
            TransportError::NotSupported => libc::ENOSYS,
            TransportError::Interrupted => libc::EINTR,
            TransportError::Protocol(_) => libc::EIO,
            TransportError::Errno(errno) => errno,
            TransportError::OutOfMemory => libc::ENOMEM,
        }
    }
}

/// Errors returned by the device endpoint entry points.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EndpointError {
    /// The slot index does not name a device.
    #[error("no such device")]
    NoSuchDevice,
    /// The slot is already open, or a dead session still lingers on it.
    #[error("device busy")]
    Busy,
    /// A non-blocking read found the outbound queue empty.
    #[error("no request pending")]
    WouldBlock,
    /// The popped request had already been answered (interrupt completed
    /// ahead of the server reading it) and was dropped; retry the read.
    #[error("request withdrawn")]
    Withdrawn,
    /// The session attached to this slot is dead.
    #[error("session dead")]
    Dead,
    /// A write was attempted against a session that is no longer connected.
    #[error("not connected")]
    NotConnected,
    /// The caller handed the endpoint a malformed message.
    #[error("invalid argument: {0}")]
    Invalid(ProtocolViolation),
    /// An ioctl argument carried bits the endpoint does not know.
    #[error("invalid ioctl argument")]
    InvalidArgument,
    /// An ioctl was issued before a session was attached to the slot.
    #[error("no session attached")]
    NoSession,
    /// An ioctl-driven cache operation failed with an errno.
    #[error("ioctl target errno {0}")]
    Io(i32),
}

impl From<EndpointError> for i32 {
    fn from(e: EndpointError) -> Self {
        match e {
            EndpointError::NoSuchDevice => libc::ENXIO,
            EndpointError::Busy => libc::EBUSY,
            EndpointError::WouldBlock => libc::EAGAIN,
            EndpointError::Withdrawn => libc::EINTR,
            EndpointError::Dead => libc::ENODEV,
            EndpointError::NotConnected => libc::ENOTCONN,
            EndpointError::Invalid(_) | EndpointError::InvalidArgument => libc::EINVAL,
            EndpointError::NoSession => libc::ENXIO,
            EndpointError::Io(errno) => errno,
        }
    }
}
