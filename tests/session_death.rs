#![allow(clippy::unwrap_used, missing_docs)]

//! Session death: waiters drain with "connection lost", later dispatches
//! fail immediately, and the daemon timeout kills a silent session.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, MockReply};
use fusegate::dispatch::{Request, dispatch};
use fusegate::error::TransportError;
use fusegate::session::SessionConfig;
use fusegate::wire::{Caller, Opcode};

#[test]
fn device_close_wakes_all_waiters_with_connection_lost() {
    // The server never answers; two callers block.
    let harness = Harness::start(Arc::new(|_, _| MockReply::Silent));

    let mut waiters = Vec::new();
    for _ in 0..2 {
        let session = Arc::clone(&harness.session);
        waiters.push(std::thread::spawn(move || {
            dispatch(
                &session,
                Request::new(Opcode::Read, 3, Caller::default(), &[]),
            )
        }));
    }
    // Give the callers time to publish their tickets.
    std::thread::sleep(Duration::from_millis(50));

    harness.handle.close();

    for waiter in waiters {
        let result = waiter.join().unwrap();
        assert_eq!(result.unwrap_err(), TransportError::ConnectionLost);
    }

    // A third caller dispatching afterwards fails immediately.
    let late = dispatch(
        &harness.session,
        Request::new(Opcode::Getattr, 1, Caller::default(), &[]),
    );
    assert_eq!(late.unwrap_err(), TransportError::ConnectionLost);
}

#[test]
fn kill_ioctl_marks_session_dead() {
    let harness = Harness::start(Arc::new(|_, _| MockReply::Silent));
    let session = Arc::clone(&harness.session);
    let waiter = std::thread::spawn(move || {
        dispatch(
            &session,
            Request::new(Opcode::Getattr, 1, Caller::default(), &[]),
        )
    });
    std::thread::sleep(Duration::from_millis(50));

    harness
        .handle
        .ioctl(fusegate::device::Ioctl::SetDaemonDead)
        .unwrap();

    assert_eq!(
        waiter.join().unwrap().unwrap_err(),
        TransportError::ConnectionLost
    );
    assert!(harness.session.is_dead());
}

#[test]
fn daemon_timeout_declares_the_session_dead() {
    let config = SessionConfig {
        daemon_timeout: Some(Duration::from_millis(100)),
        ..SessionConfig::default()
    };
    let harness = Harness::start_with_config(Arc::new(|_, _| MockReply::Silent), config);

    let err = dispatch(
        &harness.session,
        Request::new(Opcode::Getattr, 1, Caller::default(), &[]),
    )
    .unwrap_err();
    assert_eq!(err, TransportError::ConnectionLost);
    assert!(harness.session.is_dead());
}

#[test]
fn write_to_dead_session_is_not_connected() {
    let harness = Harness::start(Arc::new(|_, _| MockReply::Silent));
    harness.session.set_dead();
    let frame = common::raw_reply(1, 0, &[], None);
    assert_eq!(
        harness.handle.write_reply(&frame).unwrap_err(),
        fusegate::error::EndpointError::NotConnected
    );
}
