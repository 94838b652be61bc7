#![allow(clippy::unwrap_used, missing_docs)]

//! Ticket uniqueness, reply matching, and per-caller ordering.

mod common;

use std::sync::Arc;

use common::{Harness, MockReply, with_init};
use fusegate::dispatch::{Request, dispatch};
use fusegate::error::TransportError;
use fusegate::wire::{Caller, Opcode, ReadIn};
use zerocopy::{FromBytes, IntoBytes};

#[test]
fn concurrent_dispatches_get_distinct_nonzero_ids() {
    let seen = Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
    let seen_in_server = Arc::clone(&seen);
    let harness = Harness::start(Arc::new(move |header, _body| {
        assert_ne!(header.unique, 0, "unique ids are nonzero");
        assert!(
            seen_in_server.lock().unwrap().insert(header.unique),
            "unique id {} reused while in flight",
            header.unique
        );
        MockReply::Data(Vec::new())
    }));

    let mut callers = Vec::new();
    for _ in 0..8 {
        let session = Arc::clone(&harness.session);
        callers.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let reply = dispatch(
                    &session,
                    Request::new(Opcode::Getattr, 1, Caller::default(), &[]),
                )
                .unwrap();
                assert_eq!(reply.error, 0);
            }
        }));
    }
    for caller in callers {
        caller.join().unwrap();
    }
    assert_eq!(seen.lock().unwrap().len(), 8 * 50);
}

#[test]
fn reply_reaches_exactly_its_own_ticket() {
    let harness = Harness::start(Arc::new(|header, _| {
        // Echo the unique id back in the payload so the caller can check
        // the reply it was woken with is its own.
        MockReply::Data(header.unique.to_le_bytes().to_vec())
    }));

    let mut callers = Vec::new();
    for _ in 0..4 {
        let session = Arc::clone(&harness.session);
        callers.push(std::thread::spawn(move || {
            for _ in 0..100 {
                let reply = dispatch(
                    &session,
                    Request::new(Opcode::Getattr, 1, Caller::default(), &[]),
                )
                .unwrap();
                assert_eq!(reply.body.len(), 8);
            }
        }));
    }
    for caller in callers {
        caller.join().unwrap();
    }
}

#[test]
fn orphan_reply_is_dropped_silently() {
    let harness = Harness::start(with_init(|_, _| MockReply::Data(Vec::new())));
    // No ticket with unique 999_999 exists; the write succeeds and nothing
    // is woken.
    let frame = common::raw_reply(999_999, 0, &[], None);
    harness.handle.write_reply(&frame).unwrap();

    // The session still works afterwards.
    let reply = dispatch(
        &harness.session,
        Request::new(Opcode::Getattr, 1, Caller::default(), &[]),
    );
    assert!(reply.is_ok());
}

#[test]
fn read_replies_arrive_in_issue_order_per_caller() {
    // The server answers every READ with the requested offset, so a caller
    // issuing sequential reads can verify ordering.
    let harness = Harness::start(with_init(|_, body| {
        let (arg, _) = ReadIn::read_from_prefix(body).unwrap();
        MockReply::Data(arg.offset.to_le_bytes().to_vec())
    }));

    let session = Arc::clone(&harness.session);
    for offset in 0..200_u64 {
        let payload = ReadIn {
            fh: 7,
            offset,
            size: 8,
            padding: 0,
        };
        let reply = dispatch(
            &session,
            Request::new(Opcode::Read, 2, Caller::default(), payload.as_bytes()),
        )
        .unwrap();
        let echoed = u64::from_le_bytes(reply.body[..].try_into().unwrap());
        assert_eq!(echoed, offset);
    }
}

#[test]
fn semantic_errors_pass_through_verbatim() {
    let harness = Harness::start(Arc::new(|_, _| MockReply::Error(libc::EACCES)));
    let err = dispatch(
        &harness.session,
        Request::new(Opcode::Unlink, 1, Caller::default(), b"f\0"),
    )
    .unwrap_err();
    assert_eq!(err, TransportError::Errno(libc::EACCES));
}
