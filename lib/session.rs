//! Per-mount session state shared between the dispatcher and the device
//! endpoint.
//!
//! A session owns the outbound FIFO of tickets awaiting the server and the
//! awaited set of tickets expecting a reply. Tickets are published to the
//! awaited set *before* they become visible on the outbound queue, so the
//! server can never read a request whose id is not yet matchable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::device::AvfiSink;
use crate::error::{EndpointError, TransportError};
use crate::ticket::Ticket;
use crate::wire::{
    DEFAULT_BLOCKSIZE, DEFAULT_IOSIZE, DEFAULT_MAX_WRITE, InitIn, InitOut, KERNEL_MINOR_VERSION,
    KERNEL_VERSION, MIN_SUPPORTED_MINOR, Opcode, SessionFlags,
};

/// Tunables fixed at session creation.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest readahead advertised in INIT.
    pub max_readahead: u32,
    /// Capability flags requested from the server.
    pub init_flags: SessionFlags,
    /// Filesystem block size used for write chunking.
    pub blocksize: u32,
    /// Transfer unit for READ and READDIR.
    pub iosize: u32,
    /// Bound on how long a dispatch waits for any reply before the whole
    /// session is declared dead. `None` waits forever.
    pub daemon_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_readahead: DEFAULT_IOSIZE,
            init_flags: SessionFlags::ASYNC_READ | SessionFlags::ATOMIC_O_TRUNC,
            blocksize: DEFAULT_BLOCKSIZE,
            iosize: DEFAULT_IOSIZE,
            daemon_timeout: None,
        }
    }
}

/// Capabilities granted by the server's INIT reply.
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    /// Server minor protocol revision.
    pub minor: u32,
    /// Flags both sides agreed on.
    pub flags: SessionFlags,
    /// Largest WRITE payload the server accepts.
    pub max_write: u32,
}

/// Coarse lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached to a slot, INIT not yet dispatched.
    Created,
    /// INIT is on the wire.
    InitSent,
    /// Handshake complete; requests flow.
    Ready,
    /// Dead but a mount still refers to it.
    Dying,
    /// Dead and unmounted; the slot may tear it down.
    Dead,
}

#[derive(Debug, Default)]
struct Queue {
    outbound: VecDeque<Arc<Ticket>>,
    awaited: FxHashMap<u64, Arc<Ticket>>,
    dead: bool,
}

/// Shared per-mount state: queues, liveness, negotiated capabilities.
pub struct Session {
    owner_pid: u32,
    config: SessionConfig,
    unique: AtomicU64,
    noimpl: AtomicU64,
    dead: AtomicBool,
    init_sent: AtomicBool,
    inited: AtomicBool,
    mounted: AtomicBool,
    queue: Mutex<Queue>,
    reader_cv: Condvar,
    negotiated: Mutex<Option<Negotiated>>,
    avfi: Mutex<Option<Weak<dyn AvfiSink + Send + Sync>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("owner_pid", &self.owner_pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A fresh session owned by the server process `owner_pid`.
    #[must_use]
    pub fn new(owner_pid: u32, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            owner_pid,
            config,
            unique: AtomicU64::new(1),
            noimpl: AtomicU64::new(0),
            dead: AtomicBool::new(false),
            init_sent: AtomicBool::new(false),
            inited: AtomicBool::new(false),
            mounted: AtomicBool::new(false),
            queue: Mutex::new(Queue::default()),
            reader_cv: Condvar::new(),
            negotiated: Mutex::new(None),
            avfi: Mutex::new(None),
        })
    }

    /// Pid of the server process that opened the device.
    #[must_use]
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// The session's creation-time tunables.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Coarse lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.dead.load(Ordering::Acquire) {
            if self.mounted.load(Ordering::Acquire) {
                SessionState::Dying
            } else {
                SessionState::Dead
            }
        } else if self.inited.load(Ordering::Acquire) {
            SessionState::Ready
        } else if self.init_sent.load(Ordering::Acquire) {
            SessionState::InitSent
        } else {
            SessionState::Created
        }
    }

    /// Allocate the next unique id, skipping zero on wrap.
    #[must_use]
    pub fn next_unique(&self) -> u64 {
        loop {
            let unique = self.unique.fetch_add(1, Ordering::Relaxed);
            if unique != 0 {
                return unique;
            }
        }
    }

    /// Publish a ticket: awaited set first, then the outbound tail.
    pub fn enqueue(&self, ticket: &Arc<Ticket>) -> Result<(), TransportError> {
        self.enqueue_at(ticket, false)
    }

    /// Publish a ticket at the *head* of the outbound queue (INTERRUPT).
    pub fn enqueue_head(&self, ticket: &Arc<Ticket>) -> Result<(), TransportError> {
        self.enqueue_at(ticket, true)
    }

    fn enqueue_at(&self, ticket: &Arc<Ticket>, head: bool) -> Result<(), TransportError> {
        let mut queue = self.lock_queue();
        if queue.dead {
            return Err(TransportError::ConnectionLost);
        }
        queue.awaited.insert(ticket.unique(), Arc::clone(ticket));
        if head {
            queue.outbound.push_front(Arc::clone(ticket));
        } else {
            queue.outbound.push_back(Arc::clone(ticket));
        }
        drop(queue);
        self.reader_cv.notify_one();
        Ok(())
    }

    /// Publish a ticket that expects no reply (FORGET): outbound only, never
    /// awaited, so anything the server writes back for it is dropped as an
    /// orphan.
    pub fn enqueue_one_way(&self, ticket: &Arc<Ticket>) -> Result<(), TransportError> {
        let mut queue = self.lock_queue();
        if queue.dead {
            return Err(TransportError::ConnectionLost);
        }
        queue.outbound.push_back(Arc::clone(ticket));
        drop(queue);
        self.reader_cv.notify_one();
        Ok(())
    }

    /// Re-queue an INTERRUPT ticket the server answered with EAGAIN.
    pub fn requeue_interrupt(&self, ticket: &Arc<Ticket>) {
        let mut queue = self.lock_queue();
        if queue.dead {
            return;
        }
        ticket.reset_for_requeue();
        queue.awaited.insert(ticket.unique(), Arc::clone(ticket));
        queue.outbound.push_front(Arc::clone(ticket));
        drop(queue);
        self.reader_cv.notify_one();
    }

    /// Pop the next request for a server reader.
    ///
    /// Blocks until work arrives or the session dies, unless `blocking` is
    /// false in which case an empty queue is [`EndpointError::WouldBlock`].
    pub fn pop_request(&self, blocking: bool) -> Result<Arc<Ticket>, EndpointError> {
        let mut queue = self.lock_queue();
        loop {
            if queue.dead {
                return Err(EndpointError::Dead);
            }
            if let Some(ticket) = queue.outbound.pop_front() {
                return Ok(ticket);
            }
            if !blocking {
                return Err(EndpointError::WouldBlock);
            }
            queue = match self.reader_cv.wait(queue) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Remove and return the awaited ticket with this unique id, if any.
    pub fn take_awaited(&self, unique: u64) -> Option<Arc<Ticket>> {
        self.lock_queue().awaited.remove(&unique)
    }

    /// Withdraw a ticket the server has not read yet: remove it from both
    /// the outbound queue and the awaited set in one step. Returns `false`
    /// if the server already holds the request.
    pub fn withdraw_unread(&self, ticket: &Arc<Ticket>) -> bool {
        let mut queue = self.lock_queue();
        let Some(pos) = queue
            .outbound
            .iter()
            .position(|t| t.unique() == ticket.unique())
        else {
            return false;
        };
        queue.outbound.remove(pos);
        queue.awaited.remove(&ticket.unique());
        true
    }

    /// Whether any request is deliverable (or the session is dead, which a
    /// poller must also observe).
    #[must_use]
    pub fn poll_readable(&self) -> bool {
        let queue = self.lock_queue();
        queue.dead || !queue.outbound.is_empty()
    }

    /// Mark the session dead: reject every awaited ticket with "connection
    /// lost", drop queued work, and wake all endpoint readers.
    pub fn set_dead(&self) {
        let drained = {
            let mut queue = self.lock_queue();
            if queue.dead {
                return;
            }
            queue.dead = true;
            queue.outbound.clear();
            std::mem::take(&mut queue.awaited)
        };
        self.dead.store(true, Ordering::Release);
        debug!(waiters = drained.len(), "session marked dead");
        for ticket in drained.into_values() {
            ticket.fail_dead();
        }
        self.reader_cv.notify_all();
    }

    /// Whether the dead flag is set.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Record that INIT has been put on the wire.
    pub fn note_init_sent(&self) {
        self.init_sent.store(true, Ordering::Release);
    }

    /// The INIT payload advertising this transport's revision and wants.
    #[must_use]
    pub fn init_request(&self) -> InitIn {
        InitIn {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
            max_readahead: self.config.max_readahead,
            flags: self.config.init_flags.bits(),
        }
    }

    /// Apply the server's INIT reply.
    ///
    /// A server older than the minimum supported revision fails the session:
    /// it is marked dead and the caller sees "protocol not supported".
    pub fn complete_init(&self, out: &InitOut) -> Result<Negotiated, TransportError> {
        if out.major < KERNEL_VERSION
            || (out.major == KERNEL_VERSION && out.minor < MIN_SUPPORTED_MINOR)
        {
            debug!(major = out.major, minor = out.minor, "unsupported server revision");
            self.set_dead();
            return Err(TransportError::Errno(libc::EPROTONOSUPPORT));
        }
        let granted = Negotiated {
            minor: out.minor.min(KERNEL_MINOR_VERSION),
            flags: self.config.init_flags
                & SessionFlags::from_bits_truncate(out.flags),
            max_write: if out.max_write == 0 {
                DEFAULT_MAX_WRITE
            } else {
                out.max_write.min(DEFAULT_MAX_WRITE)
            },
        };
        *self.lock_negotiated() = Some(granted);
        self.inited.store(true, Ordering::Release);
        Ok(granted)
    }

    /// Whether the INIT handshake has completed.
    #[must_use]
    pub fn handshake_complete(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    /// Negotiated capabilities, if INIT has completed.
    #[must_use]
    pub fn negotiated(&self) -> Option<Negotiated> {
        *self.lock_negotiated()
    }

    /// Largest WRITE payload permitted on this session.
    #[must_use]
    pub fn max_write(&self) -> u32 {
        self.lock_negotiated()
            .map_or(DEFAULT_MAX_WRITE, |n| n.max_write)
    }

    /// Capability flags both sides agreed on; empty before INIT.
    #[must_use]
    pub fn flags(&self) -> SessionFlags {
        self.lock_negotiated()
            .map_or(SessionFlags::empty(), |n| n.flags)
    }

    /// Record a "function not implemented" reply for an optional opcode.
    /// Sticky for the life of the session.
    pub fn mark_unsupported(&self, opcode: Opcode) {
        if let Some(bit) = opcode.noimpl_bit() {
            self.noimpl.fetch_or(1 << bit, Ordering::Relaxed);
        }
    }

    /// Whether an opcode is known to be unimplemented by the server.
    #[must_use]
    pub fn is_unsupported(&self, opcode: Opcode) -> bool {
        opcode
            .noimpl_bit()
            .is_some_and(|bit| self.noimpl.load(Ordering::Relaxed) & (1 << bit) != 0)
    }

    /// Overwrite the not-implemented mask (set-implemented-bits ioctl).
    pub fn set_noimpl_mask(&self, mask: u64) {
        self.noimpl.store(mask, Ordering::Relaxed);
    }

    /// The current not-implemented mask.
    #[must_use]
    pub fn noimpl_mask(&self) -> u64 {
        self.noimpl.load(Ordering::Relaxed)
    }

    /// Note that a mount now refers to this session.
    pub fn attach_mount(&self) {
        self.mounted.store(true, Ordering::Release);
    }

    /// Note that the mount is gone.
    pub fn detach_mount(&self) {
        self.mounted.store(false, Ordering::Release);
    }

    /// Whether a mount still refers to this session.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Install the adapter that services alter-vnode-for-inode ioctls.
    pub fn set_avfi_sink(&self, sink: Weak<dyn AvfiSink + Send + Sync>) {
        *self.lock_avfi() = Some(sink);
    }

    /// The registered AVFI sink, if the adapter is still alive.
    #[must_use]
    pub fn avfi_sink(&self) -> Option<Arc<dyn AvfiSink + Send + Sync>> {
        self.lock_avfi().as_ref().and_then(Weak::upgrade)
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_negotiated(&self) -> MutexGuard<'_, Option<Negotiated>> {
        match self.negotiated.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[expect(clippy::type_complexity, reason = "private accessor for one field")]
    fn lock_avfi(&self) -> MutexGuard<'_, Option<Weak<dyn AvfiSink + Send + Sync>>> {
        match self.avfi.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::ReplyDisposition;
    use crate::wire;

    fn ticket(session: &Session, opcode: Opcode) -> Arc<Ticket> {
        let unique = session.next_unique();
        Ticket::new(
            unique,
            opcode,
            wire::frame_request(opcode, unique, wire::ROOT_ID, wire::Caller::default(), &[], 0),
            None,
            ReplyDisposition::Standard,
        )
    }

    #[test]
    fn uniques_are_nonzero_and_distinct() {
        let session = Session::new(100, SessionConfig::default());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let unique = session.next_unique();
            assert_ne!(unique, 0);
            assert!(seen.insert(unique));
        }
    }

    #[test]
    fn publish_makes_ticket_awaited_before_readable() {
        let session = Session::new(100, SessionConfig::default());
        let t = ticket(&session, Opcode::Getattr);
        session.enqueue(&t).expect("live session");
        // The awaited entry must exist no later than the queued one.
        let popped = session.pop_request(false).expect("queued");
        assert_eq!(popped.unique(), t.unique());
        assert!(session.take_awaited(t.unique()).is_some());
    }

    #[test]
    fn head_insert_orders_before_tail() {
        let session = Session::new(100, SessionConfig::default());
        let a = ticket(&session, Opcode::Read);
        let b = ticket(&session, Opcode::Interrupt);
        session.enqueue(&a).expect("live");
        session.enqueue_head(&b).expect("live");
        assert_eq!(
            session.pop_request(false).expect("queued").unique(),
            b.unique()
        );
        assert_eq!(
            session.pop_request(false).expect("queued").unique(),
            a.unique()
        );
    }

    #[test]
    fn dead_session_rejects_enqueue_and_drains_waiters() {
        let session = Session::new(100, SessionConfig::default());
        let t = ticket(&session, Opcode::Read);
        session.enqueue(&t).expect("live");
        session.set_dead();
        assert!(matches!(
            t.poll_done(),
            Some(crate::ticket::WaitOutcome::Dead)
        ));
        let late = ticket(&session, Opcode::Read);
        assert_eq!(
            session.enqueue(&late).expect_err("dead"),
            TransportError::ConnectionLost
        );
        assert_eq!(
            session.pop_request(false).expect_err("dead"),
            EndpointError::Dead
        );
    }

    #[test]
    fn init_rejects_ancient_server() {
        let session = Session::new(100, SessionConfig::default());
        let out = InitOut {
            major: 7,
            minor: 5,
            ..InitOut::default()
        };
        assert_eq!(
            session.complete_init(&out).expect_err("too old"),
            TransportError::Errno(libc::EPROTONOSUPPORT)
        );
        assert!(session.is_dead());
    }

    #[test]
    fn noimpl_mask_is_sticky_and_overwritable() {
        let session = Session::new(100, SessionConfig::default());
        assert!(!session.is_unsupported(Opcode::Getxtimes));
        session.mark_unsupported(Opcode::Getxtimes);
        assert!(session.is_unsupported(Opcode::Getxtimes));
        session.set_noimpl_mask(0);
        assert!(!session.is_unsupported(Opcode::Getxtimes));
    }
}
