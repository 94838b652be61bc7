//! The character-device-shaped protocol endpoint.
//!
//! A process-wide table of N slots; each slot pairs one server process with
//! at most one session. The server pulls framed requests with
//! [`DeviceHandle::read_request`], posts replies with
//! [`DeviceHandle::write_reply`], and controls the session through a small
//! ioctl set. The concrete OS character-device glue is out of scope; these
//! entry points carry its exact semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use bytes::Bytes;
use tracing::{debug, warn};
use zerocopy::FromBytes;

use crate::error::{EndpointError, ProtocolViolation};
use crate::session::{Session, SessionConfig};
use crate::ticket::{Reply, ReplyDisposition};
use crate::wire::OutHeader;

/// Number of slots a default table exposes.
pub const DEFAULT_SLOTS: usize = 24;

bitflags! {
    /// Command mask for the alter-vnode-for-inode ioctl.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AvfiFlags: u32 {
        /// Revoke the inode: purge caches and schedule it for recycling.
        const MARKGONE        = 1 << 0;
        /// Purge the cached attributes for the inode.
        const PURGEATTRCACHE  = 1 << 1;
        /// Purge the name cache entries pointing at the inode.
        const PURGEVNCACHE    = 1 << 2;
        /// Apply `ubc_flags` to the inode's cached pages.
        const UBC             = 1 << 3;
        /// Set the in-kernel file size to `size`.
        const UBC_SETSIZE     = 1 << 4;
        /// Emit a filesystem-event note with `note`.
        const KNOTE           = 1 << 5;
    }
}

bitflags! {
    /// Page-cache actions for [`AvfiFlags::UBC`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UbcFlags: u32 {
        /// Push dirty pages to the server.
        const PUSHDIRTY  = 1 << 0;
        /// Push all pages to the server.
        const PUSHALL    = 1 << 1;
        /// Invalidate cached pages.
        const INVALIDATE = 1 << 2;
        /// Wait for the push to complete.
        const SYNC       = 1 << 3;
    }
}

/// Argument of the alter-vnode-for-inode ioctl. `cmd` is a raw mask so the
/// endpoint can reject unknown bits with "invalid argument".
#[derive(Debug, Clone, Copy)]
pub struct AvfiRequest {
    /// Raw [`AvfiFlags`] mask.
    pub cmd: u32,
    /// Inode the command applies to.
    pub inode: u64,
    /// New size for [`AvfiFlags::UBC_SETSIZE`].
    pub size: u64,
    /// Raw [`UbcFlags`] mask for [`AvfiFlags::UBC`].
    pub ubc_flags: u32,
    /// Event note for [`AvfiFlags::KNOTE`].
    pub note: u32,
}

/// Adapter-side receiver for alter-vnode-for-inode commands.
pub trait AvfiSink {
    /// Apply a validated AVFI command to the named inode.
    ///
    /// Returns a positive errno on failure (`ENOENT` when the inode is not
    /// known to the adapter).
    fn alter_vnode(&self, cmd: AvfiFlags, req: &AvfiRequest) -> Result<(), i32>;
}

/// Control commands a server may issue against its slot.
#[derive(Debug, Clone, Copy)]
pub enum Ioctl {
    /// Overwrite the session's not-implemented bitmask.
    SetNotImplemented(u64),
    /// Ask whether the INIT handshake has completed.
    GetHandshakeComplete,
    /// Mark the session dead.
    SetDaemonDead,
    /// Fetch the per-open random nonce.
    GetRandom,
    /// Force cache maintenance for one inode.
    AlterVnode(AvfiRequest),
}

/// Result of a successful [`Ioctl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    /// No data.
    Done,
    /// Whether INIT has completed.
    Handshake(bool),
    /// The per-open nonce.
    Random(u32),
}

#[derive(Debug, Default)]
struct SlotState {
    opened: bool,
    owner_pid: Option<u32>,
    random: u32,
    session: Option<Arc<Session>>,
}

/// One endpoint slot.
#[derive(Debug)]
pub struct DeviceSlot {
    index: usize,
    state: Mutex<SlotState>,
}

impl DeviceSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Tear the session down if the device is closed and the mount is gone.
    fn try_teardown(state: &mut SlotState) {
        if state.opened {
            return;
        }
        let lingering = state
            .session
            .as_ref()
            .is_some_and(|s| !s.is_mounted());
        if lingering {
            state.session = None;
        }
    }
}

/// The process-wide slot table.
///
/// Initialised once at startup; [`shutdown`](Self::shutdown) refuses while
/// any slot is open or still carries a session.
#[derive(Debug)]
pub struct DeviceTable {
    slots: Vec<Arc<DeviceSlot>>,
    global: Mutex<()>,
}

impl DeviceTable {
    /// A table with `slots` endpoint slots, numbered `0..slots`.
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots)
                .map(|index| {
                    Arc::new(DeviceSlot {
                        index,
                        state: Mutex::new(SlotState::default()),
                    })
                })
                .collect(),
            global: Mutex::new(()),
        }
    }

    /// A table with the conventional number of slots.
    #[must_use]
    pub fn with_default_slots() -> Self {
        Self::new(DEFAULT_SLOTS)
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Open a slot exclusively; the opener becomes the server.
    ///
    /// Fails with [`EndpointError::Busy`] if another caller holds the slot
    /// open, or if a dead-but-not-torn-down session still lingers on it.
    pub fn open(
        &self,
        index: usize,
        server_pid: u32,
        config: SessionConfig,
    ) -> Result<DeviceHandle, EndpointError> {
        let _global = self.lock_global();
        let slot = self
            .slots
            .get(index)
            .ok_or(EndpointError::NoSuchDevice)?;
        let mut state = slot.lock();
        if state.opened || state.session.is_some() {
            return Err(EndpointError::Busy);
        }
        let session = Session::new(server_pid, config);
        state.opened = true;
        state.owner_pid = Some(server_pid);
        state.random = rand::random();
        state.session = Some(Arc::clone(&session));
        debug!(slot = index, pid = server_pid, "device opened");
        Ok(DeviceHandle {
            slot: Arc::clone(slot),
            session,
            closed: AtomicBool::new(false),
        })
    }

    /// The session currently attached to a slot, if any.
    #[must_use]
    pub fn session_of(&self, index: usize) -> Option<Arc<Session>> {
        self.slots.get(index).and_then(|s| s.lock().session.clone())
    }

    /// Tear down a slot's session if its device is closed and its mount has
    /// been detached. Called by the mount glue after unmount.
    pub fn reap(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            DeviceSlot::try_teardown(&mut slot.lock());
        }
    }

    /// Refuse to shut down while any slot is in use or has a lingering
    /// session; otherwise drop all slots.
    pub fn shutdown(self) -> Result<(), (Self, EndpointError)> {
        let busy = {
            let _global = self.lock_global();
            self.slots.iter().find_map(|slot| {
                let state = slot.lock();
                (state.opened || state.session.is_some()).then_some(slot.index)
            })
        };
        if let Some(index) = busy {
            warn!(slot = index, "shutdown refused: slot active");
            return Err((self, EndpointError::Busy));
        }
        Ok(())
    }

    fn lock_global(&self) -> MutexGuard<'_, ()> {
        match self.global.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A server's exclusive handle on one open slot.
#[derive(Debug)]
pub struct DeviceHandle {
    slot: Arc<DeviceSlot>,
    session: Arc<Session>,
    closed: AtomicBool,
}

impl DeviceHandle {
    /// The session bound to this open.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Slot index this handle was opened on.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot.index
    }

    /// Pull the next framed request.
    ///
    /// Blocks until work arrives or the session dies; with `blocking` false
    /// an empty queue returns [`EndpointError::WouldBlock`]. A ticket that
    /// was answered before the server read it (interrupt completed first)
    /// is dropped here and surfaces as [`EndpointError::Withdrawn`]; the
    /// server should retry.
    pub fn read_request(&self, blocking: bool) -> Result<Bytes, EndpointError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EndpointError::Dead);
        }
        let ticket = self.session.pop_request(blocking)?;
        if ticket.is_answered() {
            // Withdrawn before delivery; drop its interrupt companion too.
            if let Some(interrupt) = ticket.take_interrupt() {
                interrupt.mark_answered();
                self.session.take_awaited(interrupt.unique());
            }
            debug!(unique = ticket.unique(), "dropping answered ticket");
            return Err(EndpointError::Withdrawn);
        }
        Ok(ticket.wire_frame())
    }

    /// Post a reply.
    ///
    /// The frame is audited first: it must start with a full reply header,
    /// the body length must equal `header.len - size_of::<OutHeader>()`,
    /// and a nonzero error must arrive with an empty body. The wire error is
    /// the negated errno and is normalised here. A reply whose unique id
    /// matches no awaited ticket is silently dropped.
    pub fn write_reply(&self, frame: &[u8]) -> Result<(), EndpointError> {
        if self.session.is_dead() {
            return Err(EndpointError::NotConnected);
        }
        let (header, body) = OutHeader::read_from_prefix(frame)
            .map_err(|_| EndpointError::Invalid(ProtocolViolation::HeaderTooShort))?;
        if header.len as usize != frame.len() {
            warn!("message body size does not match that in the header");
            return Err(EndpointError::Invalid(ProtocolViolation::LengthMismatch));
        }
        if !body.is_empty() && header.error != 0 {
            warn!("non-zero error for a message with a body");
            return Err(EndpointError::Invalid(ProtocolViolation::BodyWithError));
        }
        let errno = -header.error;

        let Some(ticket) = self.session.take_awaited(header.unique) else {
            debug!(unique = header.unique, "dropping unmatched reply");
            return Ok(());
        };

        match ticket.disposition() {
            ReplyDisposition::Interrupt => {
                if ticket.is_answered() {
                    return Ok(());
                }
                if errno == libc::EAGAIN {
                    // The server wants the INTERRUPT redelivered.
                    self.session.requeue_interrupt(&ticket);
                }
                // Any other answer completes the interrupt vacuously.
            }
            ReplyDisposition::Standard => {
                if let Some(interrupt) = ticket.take_interrupt() {
                    // The original request is done; withdraw its interrupt.
                    interrupt.mark_answered();
                    self.session.take_awaited(interrupt.unique());
                }
                ticket.complete(Reply {
                    error: errno,
                    body: Bytes::copy_from_slice(body),
                });
            }
        }
        Ok(())
    }

    /// Whether a request is ready (or the session is dead, which a poller
    /// must observe as readable too).
    #[must_use]
    pub fn poll_readable(&self) -> bool {
        self.session.poll_readable()
    }

    /// Issue a control command.
    pub fn ioctl(&self, cmd: Ioctl) -> Result<IoctlReply, EndpointError> {
        match cmd {
            Ioctl::SetNotImplemented(mask) => {
                self.session.set_noimpl_mask(mask);
                Ok(IoctlReply::Done)
            }
            Ioctl::GetHandshakeComplete => {
                if self.session.is_mounted() {
                    Ok(IoctlReply::Handshake(self.session.handshake_complete()))
                } else {
                    Err(EndpointError::NoSuchDevice)
                }
            }
            Ioctl::SetDaemonDead => {
                self.session.set_dead();
                Ok(IoctlReply::Done)
            }
            Ioctl::GetRandom => Ok(IoctlReply::Random(self.slot.lock().random)),
            Ioctl::AlterVnode(req) => {
                let cmd =
                    AvfiFlags::from_bits(req.cmd).ok_or(EndpointError::InvalidArgument)?;
                if UbcFlags::from_bits(req.ubc_flags).is_none() {
                    return Err(EndpointError::InvalidArgument);
                }
                let sink = self.session.avfi_sink().ok_or(EndpointError::NoSession)?;
                match sink.alter_vnode(cmd, &req) {
                    Ok(()) => Ok(IoctlReply::Done),
                    Err(errno) => Err(EndpointError::Io(errno)),
                }
            }
        }
    }

    /// Close the device: mark the session dead, wake every waiter and
    /// reader, and tear the session down if the mount is already gone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.session.set_dead();
        let mut state = self.slot.lock();
        state.opened = false;
        state.owner_pid = None;
        state.random = 0;
        DeviceSlot::try_teardown(&mut state);
        debug!(slot = self.slot.index, "device closed");
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}
