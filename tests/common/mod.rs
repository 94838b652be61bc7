#![allow(clippy::unwrap_used, missing_docs, dead_code)]

//! Shared mock-server harness for transport integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use fusegate::device::{DeviceHandle, DeviceTable};
use fusegate::error::EndpointError;
use fusegate::session::{Session, SessionConfig};
use fusegate::wire::{self, Attr, AttrOut, EntryOut, InHeader, InitOut, Opcode, OutHeader};
use zerocopy::{FromBytes, IntoBytes};

/// What the mock server does with one request.
pub enum MockReply {
    /// Success with a payload.
    Data(Vec<u8>),
    /// Error reply (positive errno).
    Error(i32),
    /// No reply at all.
    Silent,
}

pub type Responder = Arc<dyn Fn(&InHeader, &[u8]) -> MockReply + Send + Sync>;

/// Per-opcode wire traffic counters.
#[derive(Default)]
pub struct Counts {
    map: Mutex<HashMap<u32, u32>>,
}

impl Counts {
    pub fn bump(&self, opcode: u32) {
        *self.map.lock().unwrap().entry(opcode).or_insert(0) += 1;
    }

    pub fn of(&self, opcode: Opcode) -> u32 {
        *self.map.lock().unwrap().get(&(opcode as u32)).unwrap_or(&0)
    }

    pub fn total(&self) -> u32 {
        self.map.lock().unwrap().values().sum()
    }
}

/// A device table with one opened slot and a mock server thread answering
/// requests through the responder.
pub struct Harness {
    pub table: DeviceTable,
    pub handle: Arc<DeviceHandle>,
    pub session: Arc<Session>,
    pub counts: Arc<Counts>,
    server: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(responder: Responder) -> Self {
        Self::start_with_config(responder, SessionConfig::default())
    }

    pub fn start_with_config(responder: Responder, config: SessionConfig) -> Self {
        let table = DeviceTable::new(4);
        let handle = Arc::new(table.open(0, 4242, config).unwrap());
        let session = Arc::clone(handle.session());
        let counts = Arc::new(Counts::default());
        let server = spawn_server(Arc::clone(&handle), responder, Arc::clone(&counts));
        Self {
            table,
            handle,
            session,
            counts,
            server: Some(server),
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.session.set_dead();
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

pub fn spawn_server(
    handle: Arc<DeviceHandle>,
    responder: Responder,
    counts: Arc<Counts>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        let frame = match handle.read_request(true) {
            Ok(frame) => frame,
            Err(EndpointError::Withdrawn | EndpointError::WouldBlock) => continue,
            Err(_) => break,
        };
        let (header, body) = InHeader::read_from_prefix(&frame).unwrap();
        counts.bump(header.opcode);
        let result = match responder(&header, body) {
            MockReply::Data(data) => {
                handle.write_reply(&wire::frame_reply_bytes(header.unique, &data))
            }
            MockReply::Error(errno) => {
                handle.write_reply(&wire::frame_error(header.unique, errno))
            }
            MockReply::Silent => Ok(()),
        };
        if matches!(
            result,
            Err(EndpointError::NotConnected | EndpointError::Dead)
        ) {
            break;
        }
    })
}

/// A responder that completes INIT itself and routes everything else.
pub fn with_init(
    inner: impl Fn(&InHeader, &[u8]) -> MockReply + Send + Sync + 'static,
) -> Responder {
    Arc::new(move |header, body| {
        if header.opcode == Opcode::Init as u32 {
            MockReply::Data(init_out().as_bytes().to_vec())
        } else {
            inner(header, body)
        }
    })
}

pub fn init_out() -> InitOut {
    InitOut {
        major: wire::KERNEL_VERSION,
        minor: wire::KERNEL_MINOR_VERSION,
        max_readahead: 65536,
        flags: 0,
        unused: 0,
        max_write: 1 << 20,
    }
}

pub fn file_attr(ino: u64, size: u64) -> Attr {
    Attr {
        ino,
        size,
        blocks: size.div_ceil(512),
        mode: libc::S_IFREG | 0o644,
        nlink: 1,
        blksize: 4096,
        ..Attr::default()
    }
}

pub fn entry_out(ino: u64, size: u64) -> Vec<u8> {
    EntryOut {
        nodeid: ino,
        generation: 0,
        entry_valid: 1,
        attr_valid: 1,
        entry_valid_nsec: 0,
        attr_valid_nsec: 0,
        attr: file_attr(ino, size),
    }
    .as_bytes()
    .to_vec()
}

pub fn attr_out(ino: u64, size: u64) -> Vec<u8> {
    AttrOut {
        attr_valid: 1,
        attr_valid_nsec: 0,
        dummy: 0,
        attr: file_attr(ino, size),
    }
    .as_bytes()
    .to_vec()
}

/// Build a raw reply frame by hand, for audit tests.
#[allow(clippy::cast_possible_truncation)]
pub fn raw_reply(unique: u64, error: i32, body: &[u8], declared_len: Option<u32>) -> Vec<u8> {
    let header = OutHeader {
        len: declared_len.unwrap_or((OutHeader::SIZE + body.len()) as u32),
        error,
        unique,
    };
    let mut frame = header.as_bytes().to_vec();
    frame.extend_from_slice(body);
    frame
}
