//! One in-flight request: its outgoing frame, its awaited reply, and the
//! condition variable its caller blocks on.
//!
//! A ticket is shared between the dispatching caller, the session queues,
//! and the device endpoint; `Arc` carries the reference count. The session
//! owns the ticket's existence while it is queued or awaited; the ticket
//! holds no back-pointer to the session.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::Opcode;

/// A matched reply: normalised positive errno plus the payload bytes.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    /// Positive errno, or zero on success.
    pub error: i32,
    /// Reply payload past the header.
    pub body: Bytes,
}

/// How the endpoint treats a reply matched to this ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Store the reply and wake the waiter.
    Standard,
    /// INTERRUPT companion: `EAGAIN` means re-queue, anything else is
    /// swallowed. Never delivered to a caller.
    Interrupt,
}

/// Terminal states a waiter can observe.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// The server answered.
    Replied(Reply),
    /// The session died before an answer arrived.
    Dead,
    /// The supplied wait bound elapsed.
    TimedOut,
}

#[derive(Debug, Default)]
struct TicketState {
    reply: Option<Reply>,
    dead: bool,
    answered: bool,
    interrupt: Option<Arc<Ticket>>,
}

/// A single in-flight request.
#[derive(Debug)]
pub struct Ticket {
    unique: u64,
    opcode: Opcode,
    msg: Bytes,
    data: Option<Bytes>,
    disposition: ReplyDisposition,
    state: Mutex<TicketState>,
    cv: Condvar,
}

impl Ticket {
    /// Allocate a ticket for an already-framed request.
    ///
    /// `data` is an externally owned bulk buffer (WRITE payloads) appended
    /// to the frame on the wire but never copied before then; the `Bytes`
    /// handle keeps it live until the ticket is released.
    #[must_use]
    pub fn new(
        unique: u64,
        opcode: Opcode,
        msg: Bytes,
        data: Option<Bytes>,
        disposition: ReplyDisposition,
    ) -> Arc<Self> {
        Arc::new(Self {
            unique,
            opcode,
            msg,
            data,
            disposition,
            state: Mutex::new(TicketState::default()),
            cv: Condvar::new(),
        })
    }

    /// The per-session identifier; nonzero.
    #[must_use]
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// The operation this ticket carries.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// How the endpoint treats a matched reply.
    #[must_use]
    pub fn disposition(&self) -> ReplyDisposition {
        self.disposition
    }

    /// The full wire frame for the server, bulk data appended.
    #[must_use]
    pub fn wire_frame(&self) -> Bytes {
        match &self.data {
            None => self.msg.clone(),
            Some(data) => {
                let mut buf = BytesMut::with_capacity(self.msg.len() + data.len());
                buf.put_slice(&self.msg);
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }

    /// Store the reply and wake the waiter. No-op if the ticket was already
    /// answered; a reply is delivered at most once.
    pub fn complete(&self, reply: Reply) {
        let mut state = self.lock_state();
        if state.answered {
            return;
        }
        state.answered = true;
        state.reply = Some(reply);
        drop(state);
        self.cv.notify_all();
    }

    /// Complete with "connection lost": the session died under the waiter.
    pub fn fail_dead(&self) {
        let mut state = self.lock_state();
        state.dead = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Mark answered without storing a reply, so the endpoint's read path
    /// drops the ticket instead of delivering it. Returns the prior value.
    pub fn mark_answered(&self) -> bool {
        let mut state = self.lock_state();
        std::mem::replace(&mut state.answered, true)
    }

    /// Whether a reply was delivered or the ticket was withdrawn.
    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.lock_state().answered
    }

    /// Clear reply state so an INTERRUPT ticket can be queued again after
    /// the server asked for redelivery.
    pub fn reset_for_requeue(&self) {
        let mut state = self.lock_state();
        state.answered = false;
        state.reply = None;
    }

    /// Link the INTERRUPT companion sent on behalf of this ticket.
    pub fn attach_interrupt(&self, interrupt: Arc<Ticket>) {
        self.lock_state().interrupt = Some(interrupt);
    }

    /// Detach and return the INTERRUPT companion, if any.
    pub fn take_interrupt(&self) -> Option<Arc<Ticket>> {
        self.lock_state().interrupt.take()
    }

    /// Wake the waiter so it can re-examine external state (cancellation).
    pub fn notify(&self) {
        self.cv.notify_all();
    }

    /// Non-blocking check for a terminal state.
    #[must_use]
    pub fn poll_done(&self) -> Option<WaitOutcome> {
        Self::outcome_of(&self.lock_state())
    }

    /// Block until the ticket reaches a terminal state, the bound elapses,
    /// or [`notify`](Self::notify) wakes the thread; a wake with no terminal
    /// state returns `None` so the caller can re-check cancellation.
    pub fn wait_step(&self, bound: Option<Duration>) -> Option<WaitOutcome> {
        let deadline = bound.map(|d| Instant::now() + d);
        let mut state = self.lock_state();
        if let Some(outcome) = Self::outcome_of(&state) {
            return Some(outcome);
        }
        state = match deadline {
            None => match self.cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            },
            Some(deadline) => {
                let now = Instant::now();
                let remaining = deadline.saturating_duration_since(now);
                let (guard, timeout) = match self.cv.wait_timeout(state, remaining) {
                    Ok(pair) => pair,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if timeout.timed_out() {
                    return Some(Self::outcome_of(&guard).unwrap_or(WaitOutcome::TimedOut));
                }
                guard
            }
        };
        Self::outcome_of(&state)
    }

    fn outcome_of(state: &TicketState) -> Option<WaitOutcome> {
        if let Some(reply) = &state.reply {
            return Some(WaitOutcome::Replied(reply.clone()));
        }
        if state.dead {
            return Some(WaitOutcome::Dead);
        }
        None
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TicketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    fn ticket(unique: u64) -> Arc<Ticket> {
        Ticket::new(
            unique,
            Opcode::Getattr,
            wire::frame_request(
                Opcode::Getattr,
                unique,
                wire::ROOT_ID,
                wire::Caller::default(),
                &[],
                0,
            ),
            None,
            ReplyDisposition::Standard,
        )
    }

    #[test]
    fn reply_wakes_waiter_once() {
        let t = ticket(1);
        let waiter = {
            let t = Arc::clone(&t);
            std::thread::spawn(move || loop {
                if let Some(outcome) = t.wait_step(None) {
                    return outcome;
                }
            })
        };
        t.complete(Reply {
            error: 0,
            body: Bytes::from_static(b"hi"),
        });
        // A second reply must not overwrite the first.
        t.complete(Reply {
            error: libc::EIO,
            body: Bytes::new(),
        });
        match waiter.join().expect("waiter thread") {
            WaitOutcome::Replied(reply) => {
                assert_eq!(reply.error, 0);
                assert_eq!(&reply.body[..], b"hi");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn dead_session_is_observable() {
        let t = ticket(2);
        t.fail_dead();
        assert!(matches!(t.poll_done(), Some(WaitOutcome::Dead)));
    }

    #[test]
    fn timeout_fires_without_reply() {
        let t = ticket(3);
        let outcome = t.wait_step(Some(Duration::from_millis(10)));
        assert!(matches!(outcome, Some(WaitOutcome::TimedOut)));
    }

    #[test]
    fn answered_ticket_drops_late_reply() {
        let t = ticket(4);
        assert!(!t.mark_answered());
        t.complete(Reply {
            error: 0,
            body: Bytes::from_static(b"late"),
        });
        assert!(t.poll_done().is_none());
    }

    #[test]
    fn write_frame_appends_external_data() {
        let data = Bytes::from_static(b"payload");
        let t = Ticket::new(
            5,
            Opcode::Write,
            wire::frame_request(
                Opcode::Write,
                5,
                2,
                wire::Caller::default(),
                &[0_u8; 24],
                7,
            ),
            Some(data),
            ReplyDisposition::Standard,
        );
        let frame = t.wire_frame();
        assert!(frame.ends_with(b"payload"));
        assert_eq!(frame.len(), wire::InHeader::SIZE + 24 + 7);
    }
}
