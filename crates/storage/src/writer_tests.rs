// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::dir::FileKind;
use crate::reader::{ReadEnd, XlogReader};
use tempfile::TempDir;
use tl_core::{Tag, TagKind};

fn row(lsn: Lsn) -> Row {
    Row::new(Tag::wal(TagKind::WalData), 1, lsn, format!("row-{}", lsn)).with_lsn(lsn)
}

fn setup() -> (TempDir, LogDir) {
    let tmp = TempDir::new().unwrap();
    let dir = LogDir::wal(tmp.path().join("wal")).unwrap();
    (tmp, dir)
}

#[test]
fn create_writes_inprogress_file() {
    let (_tmp, dir) = setup();
    let writer = XlogWriter::create(&dir, 1, &FileHeader::new(FileKind::Xlog)).unwrap();

    assert!(writer.path().ends_with("00000000000000000001.xlog.inprogress"));
    assert!(writer.path().exists());
    assert_eq!(writer.next_lsn(), 1);
}

#[test]
fn append_rejects_lsn_gap() {
    let (_tmp, dir) = setup();
    let mut writer = XlogWriter::create(&dir, 1, &FileHeader::new(FileKind::Xlog)).unwrap();
    writer.append(&row(1)).unwrap();

    let err = writer.append(&row(3)).unwrap_err();
    assert!(matches!(err, LogError::LsnOrder { expected: 2, got: 3 }));
}

#[test]
fn confirm_write_moves_wet_rows() {
    let (_tmp, dir) = setup();
    let mut writer = XlogWriter::create(&dir, 10, &FileHeader::new(FileKind::Xlog)).unwrap();
    let first = writer.append(&row(10)).unwrap();
    let second = writer.append(&row(11)).unwrap();
    assert!(second > first);
    assert_eq!(writer.wet_rows(), 2);
    assert_eq!(writer.confirmed_lsn(), None);

    let confirmed = writer.confirm_write().unwrap();
    assert_eq!(
        confirmed,
        Confirmed {
            rows: 2,
            lsn: Some(11)
        }
    );
    assert_eq!(writer.wet_rows(), 0);

    let nothing = writer.confirm_write().unwrap();
    assert_eq!(nothing.rows, 0);
    assert_eq!(nothing.lsn, Some(11));
}

#[test]
fn close_seals_and_renames() {
    let (_tmp, dir) = setup();
    let mut writer = XlogWriter::create(&dir, 1, &FileHeader::new(FileKind::Xlog)).unwrap();
    for lsn in 1..=3 {
        writer.append(&row(lsn)).unwrap();
    }
    let sealed = writer.close().unwrap();

    assert!(sealed.ends_with("00000000000000000001.xlog"));
    assert!(!dir.file_path(1, true).exists());

    let reader = XlogReader::open(&sealed, FileKind::Xlog).unwrap();
    let mut iter = reader.rows().unwrap();
    let lsns: Vec<_> = iter.by_ref().map(|r| r.unwrap().lsn).collect();
    assert_eq!(lsns, vec![1, 2, 3]);
    assert_eq!(iter.end(), &ReadEnd::Sealed);
}

#[test]
fn create_refuses_existing_sealed_file() {
    let (_tmp, dir) = setup();
    XlogWriter::create(&dir, 1, &FileHeader::new(FileKind::Xlog))
        .unwrap()
        .close()
        .unwrap();
    let err = XlogWriter::create(&dir, 1, &FileHeader::new(FileKind::Xlog)).err();
    assert!(matches!(err, Some(LogError::Exists(_))));
}

#[test]
fn reopen_continues_after_valid_rows() {
    let (_tmp, dir) = setup();
    let mut writer = XlogWriter::create(&dir, 1, &FileHeader::new(FileKind::Xlog)).unwrap();
    writer.append(&row(1)).unwrap();
    writer.append(&row(2)).unwrap();
    writer.confirm_write().unwrap();
    writer.abandon();

    let file = dir.files().unwrap().pop().unwrap();
    let reader = XlogReader::open(&file.path, FileKind::Xlog).unwrap();
    let mut iter = reader.rows().unwrap();
    let count = iter.by_ref().count();
    let end = iter.last_valid_position();

    let mut writer = XlogWriter::reopen(&dir, &file, end, Some(2), count).unwrap();
    assert_eq!(writer.next_lsn(), 3);
    writer.append(&row(3)).unwrap();
    writer.close().unwrap();

    let reader = XlogReader::open(&dir.file_path(1, false), FileKind::Xlog).unwrap();
    assert_eq!(reader.rows().unwrap().count(), 3);
}

#[test]
fn seal_tail_cuts_partial_row() {
    let (_tmp, dir) = setup();
    let mut writer = XlogWriter::create(&dir, 1, &FileHeader::new(FileKind::Xlog)).unwrap();
    for lsn in 1..=4 {
        writer.append(&row(lsn)).unwrap();
    }
    writer.confirm_write().unwrap();
    writer.abandon();

    let file = dir.files().unwrap().pop().unwrap();
    let len = std::fs::metadata(&file.path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&file.path)
        .unwrap()
        .set_len(len - 5)
        .unwrap();

    let reader = XlogReader::open(&file.path, FileKind::Xlog).unwrap();
    let mut iter = reader.rows().unwrap();
    let good: Vec<_> = iter.by_ref().filter_map(Result::ok).collect();
    assert_eq!(good.len(), 3);
    let ReadEnd::Broken { offset, error } = iter.end().clone() else {
        panic!("expected broken tail, got {:?}", iter.end());
    };
    assert!(error.is_truncation());

    let sealed = seal_tail(&dir, &file, offset).unwrap();
    let reader = XlogReader::open(&sealed, FileKind::Xlog).unwrap();
    let mut iter = reader.rows().unwrap();
    assert_eq!(iter.by_ref().count(), 3);
    assert_eq!(iter.end(), &ReadEnd::Sealed);
}
