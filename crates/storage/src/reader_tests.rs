// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::dir::LogDir;
use crate::writer::XlogWriter;
use std::io::Write;
use tempfile::TempDir;
use tl_core::{Tag, TagKind};

fn write_file(dir: &LogDir, count: i64, seal: bool) -> PathBuf {
    let mut writer =
        XlogWriter::create(dir, 1, &FileHeader::new(FileKind::Xlog).with_scn(1, 0)).unwrap();
    for lsn in 1..=count {
        let row = Row::new(Tag::wal(TagKind::WalData), 1, lsn, vec![lsn as u8; 16]).with_lsn(lsn);
        writer.append(&row).unwrap();
    }
    if seal {
        writer.close().unwrap()
    } else {
        writer.confirm_write().unwrap();
        let path = writer.path().to_path_buf();
        writer.abandon();
        path
    }
}

fn setup() -> (TempDir, LogDir) {
    let tmp = TempDir::new().unwrap();
    let dir = LogDir::wal(tmp.path()).unwrap();
    (tmp, dir)
}

#[test]
fn open_tail_ends_without_marker() {
    let (_tmp, dir) = setup();
    let path = write_file(&dir, 5, false);

    let reader = XlogReader::open(&path, FileKind::Xlog).unwrap();
    assert_eq!(reader.header().scns.get(&1), Some(&0));
    let mut iter = reader.rows().unwrap();
    assert_eq!(iter.by_ref().count(), 5);
    assert_eq!(iter.end(), &ReadEnd::Open);
    assert_eq!(
        iter.last_valid_position(),
        std::fs::metadata(&path).unwrap().len()
    );
}

#[test]
fn bad_header_fails_open() {
    let (tmp, _dir) = setup();
    let path = tmp.path().join("00000000000000000001.xlog");
    std::fs::write(&path, "SNAP\n0.12\n\n").unwrap();

    let err = XlogReader::open(&path, FileKind::Xlog).err().unwrap();
    assert!(matches!(
        err,
        LogError::Format {
            source: FormatError::BadFileHeader(_),
            ..
        }
    ));
}

#[test]
fn flipped_payload_is_reported_at_row_start() {
    let (_tmp, dir) = setup();
    let path = write_file(&dir, 3, true);

    let reader = XlogReader::open(&path, FileKind::Xlog).unwrap();
    let mut iter = reader.rows().unwrap();
    iter.next().unwrap().unwrap();
    let second_start = iter.last_valid_position();

    let mut bytes = std::fs::read(&path).unwrap();
    let payload = second_start as usize + 4 + ROW_HEADER_SIZE;
    bytes[payload] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let mut iter = reader.rows().unwrap();
    assert!(iter.next().unwrap().is_ok());
    assert!(iter.next().unwrap().is_err());
    assert!(iter.next().is_none());
    let ReadEnd::Broken { offset, error } = iter.end() else {
        panic!("expected broken row, got {:?}", iter.end());
    };
    assert_eq!(*offset, second_start);
    assert!(!error.is_truncation());
    assert!(matches!(
        iter.end(),
        ReadEnd::Broken {
            error: FormatError::DataChecksum { .. },
            ..
        }
    ));
}

#[test]
fn garbage_marker_is_broken() {
    let (_tmp, dir) = setup();
    let path = write_file(&dir, 2, false);
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xaa; 8]).unwrap();

    let reader = XlogReader::open(&path, FileKind::Xlog).unwrap();
    let mut iter = reader.rows().unwrap();
    let results: Vec<_> = iter.by_ref().collect();
    assert_eq!(results.len(), 3);
    assert!(matches!(
        iter.end(),
        ReadEnd::Broken {
            error: FormatError::BadMarker { .. },
            ..
        }
    ));
}

#[test]
fn oversized_length_is_broken_before_reading() {
    let (_tmp, dir) = setup();
    let path = write_file(&dir, 2, false);
    let end = std::fs::metadata(&path).unwrap().len();

    // a well-formed header claiming a 4 GiB payload
    let mut header = Row::new(Tag::wal(TagKind::WalData), 1, 3, Vec::new())
        .with_lsn(3)
        .encode()
        .unwrap()
        .to_vec();
    header[38..42].copy_from_slice(&u32::MAX.to_le_bytes());
    let crc = crc32c::crc32c(&header[4..ROW_HEADER_SIZE]);
    header[..4].copy_from_slice(&crc.to_le_bytes());
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&ROW_MARKER.to_le_bytes()).unwrap();
    file.write_all(&header).unwrap();

    let reader = XlogReader::open(&path, FileKind::Xlog).unwrap();
    let mut iter = reader.rows().unwrap();
    let results: Vec<_> = iter.by_ref().collect();
    assert_eq!(results.len(), 3);
    assert!(results[2].is_err());
    assert_eq!(
        iter.end(),
        &ReadEnd::Broken {
            offset: end,
            error: FormatError::TooLarge {
                what: "row data",
                len: u32::MAX as usize,
                max: MAX_ROW_DATA,
            },
        }
    );
}

#[test]
fn rows_from_resumes_mid_file() {
    let (_tmp, dir) = setup();
    let path = write_file(&dir, 4, false);
    let reader = XlogReader::open(&path, FileKind::Xlog).unwrap();

    let mut iter = reader.rows().unwrap();
    iter.next().unwrap().unwrap();
    iter.next().unwrap().unwrap();
    let resume = iter.last_valid_position();

    let rest: Vec<_> = reader
        .rows_from(resume)
        .unwrap()
        .map(|r| r.unwrap().lsn)
        .collect();
    assert_eq!(rest, vec![3, 4]);
}
