//! The request dispatcher: formats a request, publishes its ticket, blocks
//! the caller, and returns the matched reply or a structured error.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;
use zerocopy::IntoBytes;

use crate::error::TransportError;
use crate::session::Session;
use crate::ticket::{Reply, ReplyDisposition, Ticket, WaitOutcome};
use crate::wire::{Caller, InterruptIn, Opcode, frame_request};

#[derive(Debug, Default)]
struct CancelInner {
    fired: bool,
    ticket: Option<Arc<Ticket>>,
}

/// Cooperative cancellation for one dispatch, driven by the host's signal
/// mechanism. Clone the `Arc` into the signal handler; `cancel` wakes the
/// blocked caller, which forwards an INTERRUPT for its request.
#[derive(Debug, Default)]
pub struct CancelToken {
    inner: Mutex<CancelInner>,
}

impl CancelToken {
    /// A token not yet bound to a dispatch.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fire the token and wake the bound caller, if any.
    pub fn cancel(&self) {
        let ticket = {
            let mut inner = self.lock();
            inner.fired = true;
            inner.ticket.clone()
        };
        if let Some(ticket) = ticket {
            ticket.notify();
        }
    }

    /// Whether the token has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.lock().fired
    }

    fn bind(&self, ticket: &Arc<Ticket>) {
        self.lock().ticket = Some(Arc::clone(ticket));
    }

    fn unbind(&self) {
        self.lock().ticket = None;
    }

    fn lock(&self) -> MutexGuard<'_, CancelInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One request to put on the wire.
#[derive(Debug)]
pub struct Request<'a> {
    /// The operation.
    pub opcode: Opcode,
    /// Target inode, or zero for session-scoped requests.
    pub nodeid: u64,
    /// Credentials stamped into the header.
    pub caller: Caller,
    /// Opcode-specific payload following the header.
    pub payload: &'a [u8],
    /// Externally owned bulk data (WRITE); never copied by the dispatcher.
    /// The `Bytes` handle keeps the buffer live until the ticket is
    /// released.
    pub data: Option<Bytes>,
    /// Per-call deadline; on expiry the caller behaves as if interrupted.
    pub deadline: Option<Duration>,
    /// Cooperative cancellation hook.
    pub cancel: Option<Arc<CancelToken>>,
}

impl<'a> Request<'a> {
    /// A plain request with no bulk data, deadline, or cancellation.
    #[must_use]
    pub fn new(opcode: Opcode, nodeid: u64, caller: Caller, payload: &'a [u8]) -> Self {
        Self {
            opcode,
            nodeid,
            caller,
            payload,
            data: None,
            deadline: None,
            cancel: None,
        }
    }

    /// Attach an external bulk data buffer.
    #[must_use]
    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a per-call deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancelToken>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Send one request and wait for its reply.
///
/// The ticket is published to the awaited set and the outbound queue
/// atomically with respect to the server, then the calling thread blocks on
/// the ticket's condition variable until a reply arrives, the session dies,
/// or the caller is interrupted.
///
/// A reply of "function not implemented" for a cacheable opcode is recorded
/// in the session's not-implemented mask; later dispatches of that opcode
/// short-circuit with [`TransportError::NotSupported`] without touching the
/// wire.
pub fn dispatch(session: &Arc<Session>, mut req: Request<'_>) -> Result<Reply, TransportError> {
    if session.is_dead() {
        return Err(TransportError::ConnectionLost);
    }
    if session.is_unsupported(req.opcode) {
        return Err(TransportError::NotSupported);
    }

    let unique = session.next_unique();
    let data = req.data.take();
    let msg = frame_request(
        req.opcode,
        unique,
        req.nodeid,
        req.caller,
        req.payload,
        data.as_ref().map_or(0, Bytes::len),
    );
    let ticket = Ticket::new(unique, req.opcode, msg, data, ReplyDisposition::Standard);

    if req.opcode == Opcode::Init {
        session.note_init_sent();
    }
    session.enqueue(&ticket)?;
    if let Some(cancel) = &req.cancel {
        cancel.bind(&ticket);
    }

    let outcome = wait_for_reply(session, &ticket, &req);
    if let Some(cancel) = &req.cancel {
        cancel.unbind();
    }
    outcome
}

fn wait_for_reply(
    session: &Arc<Session>,
    ticket: &Arc<Ticket>,
    req: &Request<'_>,
) -> Result<Reply, TransportError> {
    let started = Instant::now();
    let call_deadline = req.deadline.map(|d| started + d);
    let daemon_deadline = session.config().daemon_timeout.map(|d| started + d);
    let mut interrupted = false;

    loop {
        let bound = next_bound(call_deadline, daemon_deadline, interrupted);
        match ticket.wait_step(bound) {
            Some(WaitOutcome::Replied(reply)) => {
                return finish_reply(session, req.opcode, interrupted, reply);
            }
            Some(WaitOutcome::Dead) => return Err(TransportError::ConnectionLost),
            Some(WaitOutcome::TimedOut) => {
                let now = Instant::now();
                if daemon_deadline.is_some_and(|d| now >= d) {
                    // No reply within the session's liveness bound: the
                    // whole session is declared dead.
                    debug!(unique = ticket.unique(), "daemon timeout elapsed");
                    session.set_dead();
                    return Err(TransportError::ConnectionLost);
                }
                if !interrupted && call_deadline.is_some_and(|d| now >= d) {
                    interrupted = true;
                    if interrupt_or_withdraw(session, ticket) {
                        return Err(TransportError::Interrupted);
                    }
                }
            }
            None => {
                if !interrupted && req.cancel.as_ref().is_some_and(|c| c.is_fired()) {
                    // Re-check for a reply that raced the cancellation.
                    if let Some(WaitOutcome::Replied(reply)) = ticket.poll_done() {
                        return finish_reply(session, req.opcode, interrupted, reply);
                    }
                    interrupted = true;
                    if interrupt_or_withdraw(session, ticket) {
                        return Err(TransportError::Interrupted);
                    }
                }
            }
        }
    }
}

fn next_bound(
    call_deadline: Option<Instant>,
    daemon_deadline: Option<Instant>,
    interrupted: bool,
) -> Option<Duration> {
    let now = Instant::now();
    let mut nearest: Option<Instant> = daemon_deadline;
    if !interrupted && let Some(d) = call_deadline {
        nearest = Some(nearest.map_or(d, |n| n.min(d)));
    }
    nearest.map(|d| d.saturating_duration_since(now))
}

fn finish_reply(
    session: &Arc<Session>,
    opcode: Opcode,
    interrupted: bool,
    reply: Reply,
) -> Result<Reply, TransportError> {
    if reply.error == libc::ENOSYS && opcode.noimpl_bit().is_some() {
        session.mark_unsupported(opcode);
        return Err(TransportError::NotSupported);
    }
    if reply.error == libc::EINTR && interrupted {
        return Err(TransportError::Interrupted);
    }
    if reply.error != 0 {
        return Err(TransportError::from_reply_errno(reply.error));
    }
    Ok(reply)
}

/// Cancel a waiting request. Returns `true` once the caller may surface
/// "interrupted".
///
/// If the server has not read the request yet it is simply withdrawn: the
/// ticket is marked answered so the endpoint's read path drops it, and no
/// INTERRUPT goes on the wire. Otherwise a fresh INTERRUPT ticket (new
/// unique id, reply always dropped) carrying the original id is pushed at
/// the *head* of the outbound queue.
fn interrupt_or_withdraw(session: &Arc<Session>, target: &Arc<Ticket>) -> bool {
    if session.withdraw_unread(target) {
        // The server never saw the request; nothing to interrupt.
        target.mark_answered();
        return true;
    }
    send_interrupt(session, target);
    true
}

/// Send a FORGET, which carries no reply: the ticket goes on the outbound
/// queue but is never awaited.
pub fn notify_forget(session: &Arc<Session>, nodeid: u64, nlookup: u64) {
    let unique = session.next_unique();
    let payload = crate::wire::ForgetIn { nlookup };
    let msg = frame_request(
        Opcode::Forget,
        unique,
        nodeid,
        Caller::default(),
        payload.as_bytes(),
        0,
    );
    let ticket = Ticket::new(unique, Opcode::Forget, msg, None, ReplyDisposition::Standard);
    let _ = session.enqueue_one_way(&ticket);
}

fn send_interrupt(session: &Arc<Session>, target: &Arc<Ticket>) {
    let unique = session.next_unique();
    let payload = InterruptIn {
        unique: target.unique(),
    };
    let msg = frame_request(
        Opcode::Interrupt,
        unique,
        0,
        Caller::default(),
        payload.as_bytes(),
        0,
    );
    // Never reuse an interrupt ticket for another opcode; its reply, if the
    // server sends one after answering the original, must be dropped.
    let interrupt = Ticket::new(unique, Opcode::Interrupt, msg, None, ReplyDisposition::Interrupt);
    target.attach_interrupt(Arc::clone(&interrupt));
    debug!(target = target.unique(), interrupt = unique, "sending interrupt");
    let _ = session.enqueue_head(&interrupt);
}
