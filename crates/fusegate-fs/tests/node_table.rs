#![allow(clippy::unwrap_used, missing_docs)]

//! Node table correctness: path/inode round-trips, lookup counts, rename
//! and hide semantics, eviction.

use std::ffi::OsStr;
use std::path::Path;

use fusegate_fs::nodes::{NodeError, NodeTable};

#[test]
fn lookup_and_path_round_trip() {
    let table = NodeTable::new(false);
    let a = table.lookup(1, OsStr::new("a")).unwrap();
    let b = table.lookup(a.nodeid, OsStr::new("b")).unwrap();
    let c = table.lookup(b.nodeid, OsStr::new("c")).unwrap();

    assert_eq!(table.path_of(c.nodeid).unwrap(), Path::new("/a/b/c"));
    assert_eq!(table.path_of(a.nodeid).unwrap(), Path::new("/a"));
    assert_eq!(table.path_of(1).unwrap(), Path::new("/"));

    // Looking the same names up again resolves to the same nodes.
    assert_eq!(table.lookup(1, OsStr::new("a")).unwrap().nodeid, a.nodeid);
    assert_eq!(
        table.lookup(b.nodeid, OsStr::new("c")).unwrap().nodeid,
        c.nodeid
    );
}

#[test]
fn nodeids_are_neither_zero_nor_root() {
    let table = NodeTable::new(false);
    for i in 0..100 {
        let node = table
            .lookup(1, OsStr::new(&format!("f{i}")))
            .unwrap();
        assert!(node.nodeid > 1, "fresh ids start past the root id");
    }
}

#[test]
fn forget_drops_resolution_at_zero_lookups() {
    let table = NodeTable::new(false);
    let a = table.lookup(1, OsStr::new("a")).unwrap();
    let again = table.lookup(1, OsStr::new("a")).unwrap();
    assert_eq!(a.nodeid, again.nodeid);
    assert_eq!(table.info(a.nodeid).unwrap().nlookup, 2);

    table.forget(a.nodeid, 1);
    assert!(table.info(a.nodeid).is_some(), "one lookup still held");

    table.forget(a.nodeid, 1);
    assert!(table.peek(1, OsStr::new("a")).is_none(), "name unhashed");
    assert!(table.info(a.nodeid).is_none(), "node freed");
}

#[test]
fn forget_of_the_root_is_ignored() {
    let table = NodeTable::new(false);
    table.forget(1, 1_000);
    assert_eq!(table.path_of(1).unwrap(), Path::new("/"));
}

#[test]
fn path_fails_once_an_ancestor_is_unhashed() {
    let table = NodeTable::new(false);
    let dir = table.lookup(1, OsStr::new("dir")).unwrap();
    let child = table.lookup(dir.nodeid, OsStr::new("file")).unwrap();

    table.forget(dir.nodeid, 1);
    assert_eq!(
        table.path_of(child.nodeid).unwrap_err(),
        NodeError::Unreachable
    );
}

#[test]
fn rename_moves_the_key_and_unhashes_the_target() {
    let table = NodeTable::new(false);
    let a = table.lookup(1, OsStr::new("a")).unwrap();
    let b = table.lookup(1, OsStr::new("b")).unwrap();

    table
        .rename(1, OsStr::new("a"), 1, OsStr::new("b"), false)
        .unwrap();
    assert_eq!(table.peek(1, OsStr::new("b")).unwrap().nodeid, a.nodeid);
    assert!(table.peek(1, OsStr::new("a")).is_none());
    assert_eq!(table.path_of(a.nodeid).unwrap(), Path::new("/b"));
    // The overwritten node lost its name but is still referenced.
    assert_eq!(table.path_of(b.nodeid).unwrap_err(), NodeError::Unreachable);
}

#[test]
fn hide_refuses_a_concurrent_occupant() {
    let table = NodeTable::new(false);
    let _ = table.lookup(1, OsStr::new("victim")).unwrap();
    let _ = table.lookup(1, OsStr::new(".fuse_hidden00000002deadbeef")).unwrap();
    assert_eq!(
        table
            .rename(
                1,
                OsStr::new("victim"),
                1,
                OsStr::new(".fuse_hidden00000002deadbeef"),
                true,
            )
            .unwrap_err(),
        NodeError::Busy
    );
}

#[test]
fn hide_marks_the_node() {
    let table = NodeTable::new(false);
    let node = table.lookup(1, OsStr::new("f")).unwrap();
    table.open_inc(node.nodeid);
    table
        .rename(1, OsStr::new("f"), 1, OsStr::new(".fuse_hidden01"), true)
        .unwrap();
    let info = table.info(node.nodeid).unwrap();
    assert!(info.hidden);
    assert_eq!(
        table.path_of(node.nodeid).unwrap(),
        Path::new("/.fuse_hidden01")
    );
}

#[test]
fn open_counts_track_and_report_hidden_state() {
    let table = NodeTable::new(false);
    let node = table.lookup(1, OsStr::new("f")).unwrap();
    table.open_inc(node.nodeid);
    table.open_inc(node.nodeid);
    assert!(table.is_open(1, OsStr::new("f")));

    assert_eq!(table.open_dec(node.nodeid), (1, false));
    table
        .rename(1, OsStr::new("f"), 1, OsStr::new(".fuse_hidden02"), true)
        .unwrap();
    assert_eq!(table.open_dec(node.nodeid), (0, true));
}

#[test]
fn exchange_swaps_names() {
    let table = NodeTable::new(false);
    let a = table.lookup(1, OsStr::new("a")).unwrap();
    let b = table.lookup(1, OsStr::new("b")).unwrap();
    table
        .exchange(1, OsStr::new("a"), 1, OsStr::new("b"))
        .unwrap();
    assert_eq!(table.peek(1, OsStr::new("a")).unwrap().nodeid, b.nodeid);
    assert_eq!(table.peek(1, OsStr::new("b")).unwrap().nodeid, a.nodeid);
    assert_eq!(table.path_of(a.nodeid).unwrap(), Path::new("/b"));
    assert_eq!(table.path_of(b.nodeid).unwrap(), Path::new("/a"));
}

#[test]
fn case_insensitive_tables_fold_lookups() {
    let table = NodeTable::new(true);
    let a = table.lookup(1, OsStr::new("Readme.TXT")).unwrap();
    let b = table.lookup(1, OsStr::new("readme.txt")).unwrap();
    assert_eq!(a.nodeid, b.nodeid);
    // The original spelling is preserved in paths.
    assert_eq!(table.path_of(a.nodeid).unwrap(), Path::new("/Readme.TXT"));

    let sensitive = NodeTable::new(false);
    let x = sensitive.lookup(1, OsStr::new("Readme.TXT")).unwrap();
    let y = sensitive.lookup(1, OsStr::new("readme.txt")).unwrap();
    assert_ne!(x.nodeid, y.nodeid);
}
