// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot files
//!
//! Layout: one `snap_initial` row, then per shard a `shard_create` row
//! (scn and run-CRC of the shard, `row_count` data rows to follow)
//! followed by its `snap_data` rows, the consensus rows its group needs
//! to resume (promises, votes, unapplied log entries) and an optional
//! `shard_final`, and finally `snap_final`. The file is named by the last WAL lsn the
//! snapshot reflects. A file without `snap_final` is never loaded.

use crate::context::SnapshotView;
use crate::error::{RecoveryError, ShardError};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tl_core::{Lsn, Row, RowAux, Scn, ShardId, SnapInitial, Tag, TagKind};
use tl_storage::{FileHeader, FileKind, LogDir, LogError, ReadEnd, XlogReader, XlogWriter};

/// Fold per-shard checksums in shard id order
fn fold_crcs(values: impl Iterator<Item = (ShardId, u32)>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (id, crc) in values {
        hasher.update(&id.to_le_bytes());
        hasher.update(&crc.to_le_bytes());
    }
    hasher.finalize()
}

struct SnapWriter {
    writer: XlogWriter,
    next: Lsn,
    tm: f64,
}

impl SnapWriter {
    fn append(&mut self, row: Row) -> Result<(), LogError> {
        self.writer.append(&row.with_lsn(self.next).with_tm(self.tm))?;
        self.next += 1;
        Ok(())
    }
}

/// Write `view` into `dir`, returning the sealed path
pub fn write_snapshot(dir: &LogDir, view: &SnapshotView, tm: f64) -> Result<PathBuf, RecoveryError> {
    let sealed = dir.file_path(view.lsn, false);
    if sealed.exists() {
        return Err(LogError::Exists(sealed).into());
    }
    let stale = dir.file_path(view.lsn, true);
    if stale.exists() {
        tracing::warn!(path = %stale.display(), "removing unfinished snapshot");
        std::fs::remove_file(&stale).map_err(LogError::from)?;
    }

    let mut header = FileHeader::new(FileKind::Snap);
    for image in &view.shards {
        header = header.with_scn(image.id, image.scn);
    }
    let initial = SnapInitial {
        count: view
            .shards
            .iter()
            .map(|s| s.executor.snapshot_estimate() as u32)
            .sum(),
        run_crc: fold_crcs(view.shards.iter().map(|s| (s.id, s.run_crc))),
        run_crc_mod: fold_crcs(view.shards.iter().map(|s| (s.id, s.run_crc_mod))),
    };

    let mut out = SnapWriter {
        writer: XlogWriter::create(dir, view.lsn, &header)?,
        next: view.lsn,
        tm,
    };
    out.append(Row::new(Tag::snap(TagKind::SnapInitial), 0, 0, initial.encode()))?;

    for image in &view.shards {
        let expected = image.executor.snapshot_estimate();
        let mut op = image.meta.clone();
        op.row_count = expected as u32;
        op.aux = Bytes::copy_from_slice(&image.run_crc_mod.to_le_bytes());
        let create = Row::new(Tag::snap(TagKind::ShardCreate), image.id, image.scn, op.encode().map_err(ShardError::from)?)
            .with_aux(RowAux::run_crc(image.run_crc));
        out.append(create)?;

        let mut written = 0usize;
        image.executor.snapshot_write_rows(&mut |payload| {
            written += 1;
            out.append(Row::new(Tag::snap(TagKind::SnapData), image.id, image.scn, payload))
                .map_err(|e| ShardError::Storage(e.to_string()))
        })?;
        if written != expected {
            out.writer.abandon();
            return Err(RecoveryError::SnapshotInvalid {
                path: dir.file_path(view.lsn, true),
                reason: format!("shard {} wrote {} rows, estimated {}", image.id, written, expected),
            });
        }
        for row in &image.consensus_rows {
            let tag = Tag::snap(row.tag.kind());
            out.append(Row::new(tag, image.id, row.scn, row.data.clone()))?;
        }
        if image.is_final {
            out.append(Row::new(Tag::snap(TagKind::ShardFinal), image.id, image.scn, Bytes::new()))?;
        }
    }

    out.append(Row::new(Tag::snap(TagKind::SnapFinal), 0, 0, Bytes::new()))?;
    let path = out.writer.close()?;
    tracing::info!(
        path = %path.display(),
        lsn = view.lsn,
        shards = view.shards.len(),
        rows = initial.count,
        "snapshot written"
    );
    Ok(path)
}

/// Counts gathered while reading a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub path: PathBuf,
    pub shards: usize,
    pub rows: u32,
    pub scns: Vec<(ShardId, Scn)>,
}

struct OpenShard {
    id: ShardId,
    expected: u32,
    seen: u32,
}

/// Validate a snapshot and feed its rows to `apply`
///
/// Any corrupt row, a missing `snap_final`, or counts and checksums that
/// disagree with `snap_initial` reject the whole file.
pub fn read_snapshot(
    path: &Path,
    apply: &mut dyn FnMut(&Row) -> Result<(), RecoveryError>,
) -> Result<SnapshotSummary, RecoveryError> {
    let invalid = |reason: String| RecoveryError::SnapshotInvalid {
        path: path.to_path_buf(),
        reason,
    };
    let reader = XlogReader::open(path, FileKind::Snap)?;
    let mut rows = reader.rows()?;

    let mut initial: Option<SnapInitial> = None;
    let mut open: Option<OpenShard> = None;
    let mut finished = false;
    let mut summary = SnapshotSummary {
        path: path.to_path_buf(),
        shards: 0,
        rows: 0,
        scns: Vec::new(),
    };
    let mut log_crcs = Vec::new();
    let mut mod_crcs = Vec::new();

    let mut failure = None;
    for row in rows.by_ref() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        if finished {
            return Err(invalid(format!("row after snap_final at lsn {}", row.lsn)));
        }
        match row.tag.kind() {
            TagKind::SnapInitial if initial.is_none() => {
                initial = Some(SnapInitial::decode(&row.data).map_err(ShardError::from)?);
            }
            _ if initial.is_none() => {
                return Err(invalid(format!("starts with {} instead of snap_initial", row.tag)));
            }
            TagKind::ShardCreate => {
                close_shard(open.take()).map_err(invalid)?;
                let op = tl_core::ShardOp::decode(&row.data).map_err(ShardError::from)?;
                log_crcs.push((row.shard_id, row.aux.as_run_crc()));
                mod_crcs.push((row.shard_id, crate::context::module_crc(&op)));
                summary.shards += 1;
                summary.scns.push((row.shard_id, row.scn));
                open = Some(OpenShard {
                    id: row.shard_id,
                    expected: op.row_count,
                    seen: 0,
                });
            }
            TagKind::SnapData => {
                match open.as_mut() {
                    Some(shard) if shard.id == row.shard_id => shard.seen += 1,
                    _ => return Err(invalid(format!("data row for shard {} outside its section", row.shard_id))),
                }
                summary.rows += 1;
            }
            kind if kind.is_consensus() => match open.as_ref() {
                Some(shard) if shard.id == row.shard_id => {}
                _ => return Err(invalid(format!("{} row for shard {} outside its section", kind, row.shard_id))),
            },
            TagKind::SnapFinal => finished = true,
            TagKind::ShardFinal => {}
            other => return Err(invalid(format!("unexpected {} row", other))),
        }
        apply(&row)?;
    }

    if let ReadEnd::Broken { offset, error } = rows.end() {
        return Err(RecoveryError::Corrupt {
            path: path.to_path_buf(),
            offset: *offset,
            source: error.clone(),
        });
    }
    if let Some(e) = failure {
        return Err(e.into());
    }
    if !finished {
        return Err(RecoveryError::SnapshotIncomplete(path.to_path_buf()));
    }
    close_shard(open.take()).map_err(invalid)?;

    let Some(initial) = initial else {
        return Err(invalid("no snap_initial".to_string()));
    };
    if initial.count != summary.rows {
        return Err(invalid(format!("snap_initial declares {} rows, found {}", initial.count, summary.rows)));
    }
    if initial.run_crc != fold_crcs(log_crcs.into_iter()) || initial.run_crc_mod != fold_crcs(mod_crcs.into_iter()) {
        return Err(invalid("shard checksums disagree with snap_initial".to_string()));
    }
    Ok(summary)
}

fn close_shard(open: Option<OpenShard>) -> Result<(), String> {
    match open {
        Some(shard) if shard.seen != shard.expected => Err(format!(
            "shard {} declares {} rows, found {}",
            shard.id, shard.expected, shard.seen
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
