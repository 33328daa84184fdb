// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tl_core::TagKind;
use yare::parameterized;

fn data() -> Tag {
    Tag::wal(TagKind::WalData)
}

#[parameterized(
    hash = { "hash" },
    tree = { "tree" },
)]
fn put_get_delete(module: &str) {
    let mut exec = make_executor(module).unwrap();
    assert_eq!(exec.module(), module);

    exec.apply(&KvOp::put(&b"a"[..], &b"1"[..]).encode(), data())
        .unwrap();
    exec.apply(&KvOp::put(&b"b"[..], &b"2"[..]).encode(), data())
        .unwrap();
    assert_eq!(exec.get(b"a").unwrap().as_ref(), b"1");
    assert_eq!(exec.len(), 2);

    exec.apply(&KvOp::delete(&b"a"[..]).encode(), data()).unwrap();
    assert_eq!(exec.get(b"a"), None);
    assert_eq!(exec.snapshot_estimate(), 1);
}

#[test]
fn unknown_module_rejected() {
    assert!(matches!(
        make_executor("btree"),
        Err(ShardError::UnknownModule(_))
    ));
}

#[test]
fn garbage_payload_rejected() {
    let mut exec = make_executor("hash").unwrap();
    let err = exec.apply(b"\x07", data()).unwrap_err();
    assert!(matches!(err, ShardError::Payload(_)));
}

#[test]
fn state_crc_ignores_history_and_order() {
    let mut hash = HashExecutor::default();
    let mut tree = TreeExecutor::default();
    for key in ["z", "a", "m"] {
        hash.apply(&KvOp::put(key, "v").encode(), data()).unwrap();
    }
    for key in ["a", "m", "z", "gone"] {
        tree.apply(&KvOp::put(key, "v").encode(), data()).unwrap();
    }
    tree.apply(&KvOp::delete("gone").encode(), data()).unwrap();

    assert_eq!(hash.state_crc(), tree.state_crc());
}

#[test]
fn snapshot_rows_rebuild_state() {
    let mut src = TreeExecutor::default();
    for i in 0..5 {
        src.apply(&KvOp::put(format!("k{}", i), format!("v{}", i)).encode(), data())
            .unwrap();
    }

    let mut dst = TreeExecutor::default();
    let mut rows = Vec::new();
    src.snapshot_write_rows(&mut |payload| {
        rows.push(payload);
        Ok(())
    })
    .unwrap();
    assert_eq!(rows.len(), src.snapshot_estimate());
    for payload in rows {
        dst.apply(&payload, Tag::snap(TagKind::SnapData)).unwrap();
    }
    assert_eq!(dst.state_crc(), src.state_crc());
    let keys: Vec<_> = dst.range_from(b"k3").map(|(k, _)| k.clone()).collect();
    assert_eq!(keys, vec![Bytes::from("k3"), Bytes::from("k4")]);
}

#[test]
fn box_clone_is_independent() {
    let mut exec = make_executor("hash").unwrap();
    exec.apply(&KvOp::put("k", "1").encode(), data()).unwrap();
    let copy = exec.box_clone();
    exec.apply(&KvOp::put("k", "2").encode(), data()).unwrap();

    assert_eq!(copy.get(b"k").unwrap().as_ref(), b"1");
    assert_eq!(exec.get(b"k").unwrap().as_ref(), b"2");
}
