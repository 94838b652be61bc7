#![allow(clippy::unwrap_used, missing_docs)]

//! Full-stack scenarios: transport endpoint on one side, serve loop over an
//! in-memory filesystem on the other.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use fusegate::adapter::{MountConfig, MountOptions, Vfs};
use fusegate::device::{DeviceHandle, DeviceTable};
use fusegate::session::SessionConfig;
use fusegate::wire::{self, Caller, InitIn, Opcode, OutHeader};
use fusegate_fs::fs::{FileInfo, FileStat, FsContext, FsResult, PathFs, ReaddirEntry};
use fusegate_fs::serve::{Channel, ChannelError, FsServer, ServeConfig};
use zerocopy::{FromBytes, IntoBytes};

#[derive(Clone)]
enum Entry {
    Dir,
    File(Vec<u8>),
}

/// A path-keyed in-memory filesystem that logs the mutations it observes.
#[derive(Clone, Default)]
struct MemFs {
    files: Arc<Mutex<BTreeMap<PathBuf, Entry>>>,
    ops: Arc<Mutex<Vec<String>>>,
    next_fh: Arc<AtomicU64>,
}

impl MemFs {
    fn with_files(files: &[(&str, &[u8])]) -> Self {
        let fs = Self::default();
        {
            let mut map = fs.files.lock().unwrap();
            map.insert(PathBuf::from("/"), Entry::Dir);
            for (path, content) in files {
                map.insert(PathBuf::from(path), Entry::File(content.to_vec()));
            }
        }
        fs
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn paths(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .keys()
            .map(|p| p.display().to_string())
            .collect()
    }

    fn hidden_paths(&self) -> Vec<String> {
        self.paths()
            .into_iter()
            .filter(|p| p.contains(".fuse_hidden"))
            .collect()
    }
}

impl PathFs for MemFs {
    fn getattr(&self, _ctx: &FsContext, path: &Path) -> FsResult<FileStat> {
        let files = self.files.lock().unwrap();
        match files.get(path) {
            Some(Entry::Dir) => Ok(FileStat {
                mode: libc::S_IFDIR | 0o755,
                nlink: 2,
                mtime: SystemTime::UNIX_EPOCH,
                ..FileStat::default()
            }),
            Some(Entry::File(content)) => Ok(FileStat {
                mode: libc::S_IFREG | 0o644,
                size: content.len() as u64,
                mtime: SystemTime::UNIX_EPOCH,
                ..FileStat::default()
            }),
            None => Err(libc::ENOENT),
        }
    }

    fn readdir(
        &self,
        _ctx: &FsContext,
        path: &Path,
        _fi: &FileInfo,
    ) -> FsResult<Vec<ReaddirEntry>> {
        let files = self.files.lock().unwrap();
        if !matches!(files.get(path), Some(Entry::Dir)) {
            return Err(libc::ENOTDIR);
        }
        Ok(files
            .iter()
            .filter(|(p, _)| p.parent() == Some(path) && *p != path)
            .map(|(p, entry)| ReaddirEntry {
                name: p.file_name().map(OsStr::to_os_string).unwrap_or_default(),
                ino: 0,
                typ: match entry {
                    Entry::Dir => u32::from(libc::DT_DIR),
                    Entry::File(_) => u32::from(libc::DT_REG),
                },
            })
            .collect())
    }

    fn open(&self, _ctx: &FsContext, path: &Path, _flags: u32) -> FsResult<u64> {
        let files = self.files.lock().unwrap();
        if !files.contains_key(path) {
            return Err(libc::ENOENT);
        }
        Ok(self.next_fh.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn create(&self, _ctx: &FsContext, path: &Path, _mode: u32, _flags: u32) -> FsResult<u64> {
        self.log(format!("create {}", path.display()));
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Entry::File(Vec::new()));
        Ok(self.next_fh.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn read(
        &self,
        _ctx: &FsContext,
        path: &Path,
        _fi: &FileInfo,
        offset: u64,
        size: u32,
    ) -> FsResult<Bytes> {
        let files = self.files.lock().unwrap();
        let Some(Entry::File(content)) = files.get(path) else {
            return Err(libc::ENOENT);
        };
        let start = usize::try_from(offset).unwrap().min(content.len());
        let end = (start + size as usize).min(content.len());
        Ok(Bytes::copy_from_slice(&content[start..end]))
    }

    fn write(
        &self,
        _ctx: &FsContext,
        path: &Path,
        _fi: &FileInfo,
        offset: u64,
        data: &[u8],
    ) -> FsResult<u32> {
        let mut files = self.files.lock().unwrap();
        let Some(Entry::File(content)) = files.get_mut(path) else {
            return Err(libc::ENOENT);
        };
        let offset = usize::try_from(offset).unwrap();
        if content.len() < offset + data.len() {
            content.resize(offset + data.len(), 0);
        }
        content[offset..offset + data.len()].copy_from_slice(data);
        u32::try_from(data.len()).map_err(|_| libc::EINVAL)
    }

    fn unlink(&self, _ctx: &FsContext, path: &Path) -> FsResult<()> {
        self.log(format!("unlink {}", path.display()));
        match self.files.lock().unwrap().remove(path) {
            Some(_) => Ok(()),
            None => Err(libc::ENOENT),
        }
    }

    fn rename(&self, _ctx: &FsContext, from: &Path, to: &Path) -> FsResult<()> {
        self.log(format!("rename {} {}", from.display(), to.display()));
        let mut files = self.files.lock().unwrap();
        let entry = files.remove(from).ok_or(libc::ENOENT)?;
        files.insert(to.to_path_buf(), entry);
        Ok(())
    }

    fn exchange(&self, _ctx: &FsContext, a: &Path, b: &Path, _options: u64) -> FsResult<()> {
        self.log(format!("exchange {} {}", a.display(), b.display()));
        let mut files = self.files.lock().unwrap();
        let ea = files.remove(a).ok_or(libc::ENOENT)?;
        let eb = files.remove(b).ok_or(libc::ENOENT)?;
        files.insert(a.to_path_buf(), eb);
        files.insert(b.to_path_buf(), ea);
        Ok(())
    }

    fn mkdir(&self, _ctx: &FsContext, path: &Path, _mode: u32) -> FsResult<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Entry::Dir);
        Ok(())
    }

    fn rmdir(&self, _ctx: &FsContext, path: &Path) -> FsResult<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    fn release(&self, _ctx: &FsContext, path: &Path, _fi: &FileInfo) -> FsResult<()> {
        self.log(format!("release {}", path.display()));
        Ok(())
    }
}

/// Transport + serve loop wired together in-process.
struct Stack {
    _table: DeviceTable,
    handle: Arc<DeviceHandle>,
    vfs: Arc<Vfs>,
    server: Arc<FsServer<MemFs>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Stack {
    fn start(fs: MemFs, serve_config: ServeConfig, options: MountOptions) -> Self {
        let table = DeviceTable::new(1);
        let handle = Arc::new(table.open(0, 7777, SessionConfig::default()).unwrap());
        let server = Arc::new(FsServer::new(fs, serve_config));
        let thread = {
            let server = Arc::clone(&server);
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || {
                let _ = server.run(&*handle);
            })
        };
        let vfs = Vfs::mount(
            Arc::clone(handle.session()),
            MountConfig {
                options,
                ..MountConfig::default()
            },
        );
        vfs.init(Caller::default()).unwrap();
        Self {
            _table: table,
            handle,
            vfs,
            server,
            thread: Some(thread),
        }
    }

    fn caller() -> Caller {
        Caller::default()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.handle.session().set_dead();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
fn open_read_close_against_a_real_server() {
    let fs = MemFs::with_files(&[("/foo", b"hello")]);
    let stack = Stack::start(fs.clone(), ServeConfig::default(), MountOptions::ALLOW_OTHER);
    let caller = Stack::caller();

    let entry = stack.vfs.lookup(caller, 1, OsStr::new("foo")).unwrap();
    assert_eq!(entry.attr.size, 5);

    #[allow(clippy::cast_sign_loss)]
    let _fh = stack
        .vfs
        .open(caller, entry.nodeid, libc::O_RDONLY as u32)
        .unwrap();
    let data = stack.vfs.read(caller, entry.nodeid, 0, 5).unwrap();
    assert_eq!(&data[..], b"hello");

    #[allow(clippy::cast_sign_loss)]
    stack
        .vfs
        .release(caller, entry.nodeid, libc::O_RDONLY as u32)
        .unwrap();
}

#[test]
fn unlink_while_open_hides_then_removes_on_last_close() {
    // Scenario B: the server observes a RENAME to a hidden name instead of
    // an UNLINK, handles keep working, and the hidden file disappears on
    // the last close.
    let fs = MemFs::with_files(&[("/bar", b"secret!")]);
    let stack = Stack::start(fs.clone(), ServeConfig::default(), MountOptions::ALLOW_OTHER);
    let caller = Stack::caller();

    let entry = stack.vfs.lookup(caller, 1, OsStr::new("bar")).unwrap();
    #[allow(clippy::cast_sign_loss)]
    let _fh = stack
        .vfs
        .open(caller, entry.nodeid, libc::O_RDONLY as u32)
        .unwrap();

    stack.vfs.unlink(caller, 1, OsStr::new("bar")).unwrap();

    // The original name is gone, a hidden name exists, nothing was
    // unlinked on the backing store.
    let hidden = fs.hidden_paths();
    assert_eq!(hidden.len(), 1, "exactly one hidden file: {hidden:?}");
    assert!(!fs.paths().contains(&"/bar".to_string()));
    assert!(
        !fs.ops().iter().any(|op| op == "unlink /bar"),
        "no unlink of the visible name: {:?}",
        fs.ops()
    );
    assert!(
        fs.ops().iter().any(|op| op.starts_with("rename /bar /.fuse_hidden")),
        "hidden rename observed: {:?}",
        fs.ops()
    );
    assert!(stack.server.nodes().info(entry.nodeid).unwrap().hidden);

    // Reads on the existing handle still see the original content.
    let data = stack.vfs.read(caller, entry.nodeid, 0, 7).unwrap();
    assert_eq!(&data[..], b"secret!");

    // Last close: the hidden name is unlinked for real.
    #[allow(clippy::cast_sign_loss)]
    stack
        .vfs
        .release(caller, entry.nodeid, libc::O_RDONLY as u32)
        .unwrap();
    assert!(fs.hidden_paths().is_empty(), "hidden file removed after close");
    assert!(
        fs.ops().iter().any(|op| op.starts_with("unlink /.fuse_hidden")),
        "deferred unlink observed: {:?}",
        fs.ops()
    );
}

#[test]
fn hard_remove_skips_the_hidden_rename() {
    let fs = MemFs::with_files(&[("/bar", b"secret!")]);
    let serve_config = ServeConfig {
        hard_remove: true,
        ..ServeConfig::default()
    };
    let stack = Stack::start(fs.clone(), serve_config, MountOptions::ALLOW_OTHER);
    let caller = Stack::caller();

    let entry = stack.vfs.lookup(caller, 1, OsStr::new("bar")).unwrap();
    #[allow(clippy::cast_sign_loss)]
    let _fh = stack
        .vfs
        .open(caller, entry.nodeid, libc::O_RDONLY as u32)
        .unwrap();
    stack.vfs.unlink(caller, 1, OsStr::new("bar")).unwrap();

    assert!(fs.ops().contains(&"unlink /bar".to_string()));
    assert!(fs.hidden_paths().is_empty());
}

#[test]
fn rename_over_open_file_keeps_the_handle_readable() {
    // Scenario F, with the twist that the rename *target* is the open one.
    let fs = MemFs::with_files(&[("/a", b"alpha")]);
    let stack = Stack::start(fs.clone(), ServeConfig::default(), MountOptions::ALLOW_OTHER);
    let caller = Stack::caller();

    let entry = stack.vfs.lookup(caller, 1, OsStr::new("a")).unwrap();
    #[allow(clippy::cast_sign_loss)]
    let _fh = stack
        .vfs
        .open(caller, entry.nodeid, libc::O_RDONLY as u32)
        .unwrap();

    stack
        .vfs
        .rename(caller, 1, OsStr::new("a"), 1, OsStr::new("b"))
        .unwrap();

    // The open handle follows the node to its new name.
    let data = stack.vfs.read(caller, entry.nodeid, 0, 5).unwrap();
    assert_eq!(&data[..], b"alpha");

    #[allow(clippy::cast_sign_loss)]
    stack
        .vfs
        .release(caller, entry.nodeid, libc::O_RDONLY as u32)
        .unwrap();

    // Re-lookup under the new name resolves to the same node with the same
    // attributes.
    let again = stack.vfs.lookup(caller, 1, OsStr::new("b")).unwrap();
    assert_eq!(again.nodeid, entry.nodeid);
    assert_eq!(again.attr.size, 5);
}

#[test]
fn readdir_lists_server_entries() {
    let fs = MemFs::with_files(&[("/one", b"1"), ("/two", b"22")]);
    let stack = Stack::start(fs, ServeConfig::default(), MountOptions::ALLOW_OTHER);
    let caller = Stack::caller();

    let fh = stack.vfs.opendir(caller, 1, 0).unwrap();
    let entries = stack.vfs.readdir(caller, 1, fh, 0).unwrap();
    let names: Vec<OsString> = entries.iter().map(|e| e.name.clone()).collect();
    assert_eq!(names, vec![OsString::from("one"), OsString::from("two")]);
    stack.vfs.releasedir(caller, 1, fh, 0).unwrap();
}

#[test]
fn forget_evicts_server_side_nodes() {
    let fs = MemFs::with_files(&[("/foo", b"hello")]);
    let stack = Stack::start(fs, ServeConfig::default(), MountOptions::ALLOW_OTHER);
    let caller = Stack::caller();

    let entry = stack.vfs.lookup(caller, 1, OsStr::new("foo")).unwrap();
    assert!(stack.server.nodes().info(entry.nodeid).is_some());

    stack.vfs.forget(entry.nodeid, 1);
    // FORGET carries no reply; poll for the eviction.
    for _ in 0..100 {
        if stack.server.nodes().info(entry.nodeid).is_none() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("node was not evicted after FORGET");
}

#[test]
fn writes_reach_the_backing_store() {
    let fs = MemFs::with_files(&[("/log", b"")]);
    let stack = Stack::start(fs.clone(), ServeConfig::default(), MountOptions::ALLOW_OTHER);
    let caller = Stack::caller();

    let entry = stack.vfs.lookup(caller, 1, OsStr::new("log")).unwrap();
    #[allow(clippy::cast_sign_loss)]
    let _fh = stack
        .vfs
        .open(caller, entry.nodeid, libc::O_WRONLY as u32)
        .unwrap();
    let written = stack
        .vfs
        .write(caller, entry.nodeid, 0, Bytes::from_static(b"am i stored?"))
        .unwrap();
    assert_eq!(written, 12);

    let files = fs.files.lock().unwrap();
    let Some(Entry::File(content)) = files.get(Path::new("/log")) else {
        panic!("file vanished");
    };
    assert_eq!(content, b"am i stored?");
}

/// A channel that swallows replies, for driving `handle` directly.
#[derive(Default)]
struct SinkChannel {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl Channel for SinkChannel {
    fn receive(&self) -> Result<Bytes, ChannelError> {
        Err(ChannelError::Disconnected)
    }

    fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

#[test]
fn init_rejects_unsupported_revisions() {
    let server = FsServer::new(MemFs::with_files(&[]), ServeConfig::default());
    let chan = SinkChannel::default();

    let payload = InitIn {
        major: wire::KERNEL_VERSION,
        minor: 5,
        max_readahead: 65536,
        flags: 0,
    };
    let frame = wire::frame_request(
        Opcode::Init,
        1,
        0,
        Caller::default(),
        payload.as_bytes(),
        0,
    );
    server.handle(&chan, &frame).unwrap();

    let sent = chan.sent.lock().unwrap();
    let (header, _) = OutHeader::read_from_prefix(&sent[0]).unwrap();
    assert_eq!(header.error, -libc::EPROTONOSUPPORT);
}

#[test]
fn requests_before_init_fail() {
    let server = FsServer::new(MemFs::with_files(&[]), ServeConfig::default());
    let chan = SinkChannel::default();

    let frame = wire::frame_request(Opcode::Getattr, 2, 1, Caller::default(), &[0_u8; 16], 0);
    server.handle(&chan, &frame).unwrap();

    let sent = chan.sent.lock().unwrap();
    let (header, _) = OutHeader::read_from_prefix(&sent[0]).unwrap();
    assert_eq!(header.error, -libc::EIO);
}
