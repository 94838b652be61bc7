#![allow(clippy::unwrap_used, missing_docs)]

//! Interrupt machinery: withdrawal of unread requests, INTERRUPT records,
//! EAGAIN redelivery, and answer-after-interrupt.

use std::sync::Arc;
use std::time::Duration;

use fusegate::device::{DeviceHandle, DeviceTable};
use fusegate::dispatch::{CancelToken, Request, dispatch};
use fusegate::error::{EndpointError, TransportError};
use fusegate::session::SessionConfig;
use fusegate::wire::{Caller, InHeader, InterruptIn, Opcode, ReadIn, self};
use zerocopy::{FromBytes, IntoBytes};

fn manual_endpoint() -> (DeviceTable, Arc<DeviceHandle>) {
    let table = DeviceTable::new(1);
    let handle = Arc::new(table.open(0, 99, SessionConfig::default()).unwrap());
    (table, handle)
}

fn read_header(handle: &DeviceHandle) -> (InHeader, Vec<u8>) {
    let frame = handle.read_request(true).unwrap();
    let (header, body) = InHeader::read_from_prefix(&frame).unwrap();
    (header, body.to_vec())
}

fn spawn_read(
    handle: &Arc<DeviceHandle>,
    cancel: &Arc<CancelToken>,
) -> std::thread::JoinHandle<Result<fusegate::ticket::Reply, TransportError>> {
    let session = Arc::clone(handle.session());
    let cancel = Arc::clone(cancel);
    std::thread::spawn(move || {
        let payload = ReadIn {
            fh: 1,
            offset: 0,
            size: 16,
            padding: 0,
        };
        dispatch(
            &session,
            Request::new(Opcode::Read, 7, Caller::default(), payload.as_bytes())
                .with_cancel(cancel),
        )
    })
}

#[test]
fn cancelled_before_server_read_is_withdrawn() {
    let (_table, handle) = manual_endpoint();
    let cancel = CancelToken::new();
    let caller = spawn_read(&handle, &cancel);
    std::thread::sleep(Duration::from_millis(50));

    cancel.cancel();
    assert_eq!(caller.join().unwrap().unwrap_err(), TransportError::Interrupted);

    // The server never saw the request, and no INTERRUPT followed it.
    assert_eq!(
        handle.read_request(false).unwrap_err(),
        EndpointError::WouldBlock
    );
}

#[test]
fn original_answered_first_completes_interrupt_vacuously() {
    let (_table, handle) = manual_endpoint();
    let cancel = CancelToken::new();
    let caller = spawn_read(&handle, &cancel);

    let (header, _) = read_header(&handle);
    assert_eq!(header.opcode, Opcode::Read as u32);

    // The caller gives up; an INTERRUPT record is queued at the head.
    cancel.cancel();
    assert_eq!(caller.join().unwrap().unwrap_err(), TransportError::Interrupted);

    // The server answers the original before ever reading the INTERRUPT.
    handle
        .write_reply(&wire::frame_reply_bytes(header.unique, b"result"))
        .unwrap();

    // The queued INTERRUPT was withdrawn: the read drops it.
    assert_eq!(
        handle.read_request(false).unwrap_err(),
        EndpointError::Withdrawn
    );
    assert_eq!(
        handle.read_request(false).unwrap_err(),
        EndpointError::WouldBlock
    );
}

#[test]
fn eagain_redelivers_the_interrupt() {
    let (_table, handle) = manual_endpoint();
    let cancel = CancelToken::new();
    let caller = spawn_read(&handle, &cancel);

    let (original, _) = read_header(&handle);
    cancel.cancel();
    assert_eq!(caller.join().unwrap().unwrap_err(), TransportError::Interrupted);

    // One INTERRUPT record, distinct id, payload pointing at the original.
    let (intr, body) = read_header(&handle);
    assert_eq!(intr.opcode, Opcode::Interrupt as u32);
    assert_ne!(intr.unique, original.unique);
    let (payload, _) = InterruptIn::read_from_prefix(&body).unwrap();
    assert_eq!(payload.unique, original.unique);

    // The server asks for redelivery; the same record comes back.
    handle
        .write_reply(&wire::frame_error(intr.unique, libc::EAGAIN))
        .unwrap();
    let (intr_again, _) = read_header(&handle);
    assert_eq!(intr_again.opcode, Opcode::Interrupt as u32);
    assert_eq!(intr_again.unique, intr.unique);

    // The original completes; a late answer to the INTERRUPT is an orphan
    // and is dropped silently.
    handle
        .write_reply(&wire::frame_reply_bytes(original.unique, b"result"))
        .unwrap();
    handle
        .write_reply(&wire::frame_reply_bytes(intr.unique, &[]))
        .unwrap();
}

#[test]
fn reply_racing_the_cancellation_wins() {
    let (_table, handle) = manual_endpoint();
    let cancel = CancelToken::new();
    let caller = spawn_read(&handle, &cancel);

    let (header, _) = read_header(&handle);
    handle
        .write_reply(&wire::frame_reply_bytes(header.unique, b"hello"))
        .unwrap();

    let reply = caller.join().unwrap().unwrap();
    assert_eq!(&reply.body[..], b"hello");

    // Cancelling after completion is a no-op.
    cancel.cancel();
}

#[test]
fn per_call_deadline_behaves_as_interrupted() {
    let (_table, handle) = manual_endpoint();
    let session = Arc::clone(handle.session());

    let caller = std::thread::spawn(move || {
        dispatch(
            &session,
            Request::new(Opcode::Read, 7, Caller::default(), &[0_u8; 24])
                .with_deadline(Duration::from_millis(60)),
        )
    });

    // The server reads the request but never answers within the deadline.
    let (header, _) = read_header(&handle);
    assert_eq!(caller.join().unwrap().unwrap_err(), TransportError::Interrupted);

    // An INTERRUPT for it is on the wire.
    let (intr, body) = read_header(&handle);
    assert_eq!(intr.opcode, Opcode::Interrupt as u32);
    let (payload, _) = InterruptIn::read_from_prefix(&body).unwrap();
    assert_eq!(payload.unique, header.unique);
}
