// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::context::ContextConfig;
use bytes::Bytes;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;
use tl_core::{FakeClock, KvOp, Row, ShardOp, ShardType, Tag, TagKind};
use tl_storage::{FileHeader, LogDir, LogError, XlogWriter};

fn context(root: &Path) -> Context<FakeClock> {
    let wal = LogDir::wal(root.join("wal")).unwrap();
    let snap = LogDir::snap(root.join("snap")).unwrap();
    Context::new(FakeClock::new(), wal, snap, ContextConfig::default())
}

fn create_row() -> Row {
    let op = ShardOp::new(ShardType::Por, "hash", vec!["self".to_string()]);
    Row::new(Tag::sys(TagKind::ShardCreate), 1, 0, op.encode().unwrap())
}

fn data_row(scn: Scn) -> Row {
    let payload = KvOp::put(format!("k{scn}"), format!("v{scn}")).encode();
    Row::new(Tag::wal(TagKind::WalData), 1, scn, payload)
}

fn put(key: &str) -> Bytes {
    KvOp::put(key.to_string(), "v".to_string()).encode()
}

/// One shard_create row at lsn 1, then data rows scn 1..=scns
fn write_wal(dir: &LogDir, first_lsn: Lsn, rows: Vec<Row>) -> XlogWriter {
    let mut writer = XlogWriter::create(dir, first_lsn, &FileHeader::new(FileKind::Xlog)).unwrap();
    for (i, row) in rows.into_iter().enumerate() {
        writer.append(&row.with_lsn(first_lsn + i as Lsn)).unwrap();
    }
    writer.confirm_write().unwrap();
    writer
}

#[test]
fn crash_before_last_fsync_truncates_tail_at_scn_95() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let mut rows = vec![create_row()];
    rows.extend((1..=95).map(data_row));
    let mut writer = write_wal(ctx.wal_dir(), 1, rows);
    let path = writer.path().to_path_buf();
    let synced_len = std::fs::metadata(&path).unwrap().len();

    // the last five rows reach the page cache but only part of the first
    // survives the crash
    for scn in 96..=100 {
        writer.append(&data_row(scn).with_lsn(scn + 1)).unwrap();
    }
    writer.flush().unwrap();
    drop(writer);
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(synced_len + 20).unwrap();
    drop(file);

    let mut recovery = Recovery::new(ctx.clone());
    let scns = recovery.load_full(None).unwrap();
    assert_eq!(scns.get(&1), Some(&95));

    let tail = recovery.report().tail_truncated.clone().unwrap();
    assert_eq!(tail.file, path);
    assert_eq!(tail.offset, synced_len);
    assert_eq!(tail.last_lsn, Some(96));
    assert_eq!(tail.last_scn, Some(95));
    assert!(tail.error.is_truncation());
    assert_eq!(recovery.report().rows, 96);
}

#[tokio::test]
async fn promotion_seals_the_truncated_tail() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let mut rows = vec![create_row()];
    rows.extend((1..=3).map(data_row));
    let writer = write_wal(ctx.wal_dir(), 1, rows);
    let path = writer.path().to_path_buf();
    drop(writer);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&tl_core::ROW_MARKER.to_le_bytes()).unwrap();
    file.write_all(&[1, 2, 3]).unwrap();
    drop(file);

    let mut recovery = Recovery::new(ctx.clone());
    recovery.load_full(None).unwrap();
    assert!(recovery.report().tail_truncated.is_some());
    recovery.enter_primary().unwrap();
    assert_eq!(recovery.state(), RecoveryState::Primary);

    let files = ctx.wal_dir().files().unwrap();
    assert!(!files[0].in_progress);
    let scn = ctx.submit(1, Tag::wal(TagKind::WalData), put("new")).await.unwrap();
    assert_eq!(scn, 4);
    ctx.shutdown().await;

    // a second boot sees a clean log
    let again = context(tmp.path());
    let mut recovery = Recovery::new(again.clone());
    let scns = recovery.load_full(None).unwrap();
    assert_eq!(scns.get(&1), Some(&4));
    assert_eq!(recovery.report().tail_truncated, None);
    assert_eq!(again.applied_lsn(), 5);
}

#[test]
fn broken_row_before_the_last_file_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let mut rows = vec![create_row()];
    rows.extend((1..=3).map(data_row));
    let path = write_wal(ctx.wal_dir(), 1, rows).close().unwrap();
    write_wal(ctx.wal_dir(), 5, vec![data_row(4)]).close().unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(len - 8)).unwrap();
    file.write_all(&[0xaa]).unwrap();
    drop(file);

    let mut recovery = Recovery::new(ctx);
    let err = recovery.load_full(None).unwrap_err();
    assert!(matches!(err, RecoveryError::Corrupt { .. }), "{err:?}");
}

#[test]
fn bad_file_header_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    std::fs::write(ctx.wal_dir().file_path(1, false), b"JUNK\n0.12\n\n").unwrap();

    let mut recovery = Recovery::new(ctx);
    let err = recovery.load_full(None).unwrap_err();
    assert!(matches!(err, RecoveryError::Log(LogError::Format { .. })), "{err:?}");
}

#[test]
fn replay_requires_snapshot_stage_first() {
    let tmp = TempDir::new().unwrap();
    let mut recovery = Recovery::new(context(tmp.path()));
    assert!(matches!(
        recovery.load_incr(1),
        Err(RecoveryError::InvalidState { .. })
    ));
    assert!(matches!(
        recovery.enter_primary(),
        Err(RecoveryError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn snapshot_then_incremental_replay() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    let mut recovery = Recovery::new(ctx.clone());
    recovery.load_full(None).unwrap();
    recovery.enter_primary().unwrap();

    let op = ShardOp::new(ShardType::Por, "tree", vec!["self".to_string()]);
    ctx.create_shard(1, op).await.unwrap();
    for i in 0..10 {
        ctx.submit(1, Tag::wal(TagKind::WalData), put(&format!("a{i}"))).await.unwrap();
    }
    let snap = recovery.fork_and_snapshot().await.unwrap().unwrap();
    assert!(recovery.fork_and_snapshot().await.unwrap().is_none());
    for i in 0..5 {
        ctx.submit(1, Tag::wal(TagKind::WalData), put(&format!("b{i}"))).await.unwrap();
    }
    ctx.shutdown().await;

    let again = context(tmp.path());
    let mut recovery = Recovery::new(again.clone());
    let scns = recovery.load_full(None).unwrap();
    assert_eq!(scns.get(&1), Some(&15));
    assert_eq!(recovery.report().snapshot.as_ref(), Some(&snap));
    assert_eq!(recovery.report().rows, 5);
    assert!(again.shard(1).unwrap().get(b"a3").is_some());
    assert!(again.shard(1).unwrap().get(b"b4").is_some());
}

#[tokio::test]
async fn preferred_snapshot_must_exist() {
    let tmp = TempDir::new().unwrap();
    let mut recovery = Recovery::new(context(tmp.path()));
    assert!(matches!(
        recovery.load_full(Some(42)),
        Err(RecoveryError::SnapshotMissing(42))
    ));
}

#[tokio::test]
async fn hot_standby_follows_the_primary_until_promoted() {
    let tmp = TempDir::new().unwrap();
    let primary = context(tmp.path());
    let mut boot = Recovery::new(primary.clone());
    boot.load_full(None).unwrap();
    boot.enter_primary().unwrap();
    let op = ShardOp::new(ShardType::Por, "hash", vec!["self".to_string()]);
    primary.create_shard(1, op).await.unwrap();

    let standby = context(tmp.path());
    let mut recovery = Recovery::new(standby.clone());
    recovery.load_full(None).unwrap();
    let (promote, watch_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let result = recovery
            .hot_standby(Duration::from_millis(5), watch_rx)
            .await
            .map(|_| ());
        (recovery, result)
    });

    for i in 0..20 {
        primary.submit(1, Tag::wal(TagKind::WalData), put(&format!("k{i}"))).await.unwrap();
    }
    for _ in 0..200 {
        if standby.shard(1).map(|s| s.scn()) == Some(20) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(standby.shard(1).unwrap().scn(), 20);

    primary.shutdown().await;
    promote.send(true).unwrap();
    let (recovery, result) = task.await.unwrap();
    result.unwrap();
    assert_eq!(recovery.state(), RecoveryState::Primary);

    let scn = standby.submit(1, Tag::wal(TagKind::WalData), put("after")).await.unwrap();
    assert_eq!(scn, 21);
    assert_eq!(standby.applied_lsn(), 22);
    standby.shutdown().await;
}
