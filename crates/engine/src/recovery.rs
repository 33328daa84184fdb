// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Boot state machine
//!
//! `LoadSnapshot -> ReplayWal -> {Primary | HotStandby}`, and
//! `HotStandby -> Primary` on promotion. A snapshot or WAL file with a bad
//! header, or a broken row anywhere but the last WAL file, stops recovery.
//! A broken row in the last file is the tail: replay stops there and the
//! report names it, and promotion cuts the file back and seals it.

use crate::context::{ApplyMode, Context};
use crate::error::RecoveryError;
use crate::snapshot::{read_snapshot, write_snapshot};
use crate::wal::WalWriter;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tl_core::{Clock, FormatError, Lsn, Scn, ShardId};
use tl_storage::{seal_tail, FileKind, LogFile, ReadEnd, XlogReader};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    LoadSnapshot,
    ReplayWal,
    HotStandby,
    Primary,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryState::LoadSnapshot => "load_snapshot",
            RecoveryState::ReplayWal => "replay_wal",
            RecoveryState::HotStandby => "hot_standby",
            RecoveryState::Primary => "primary",
        }
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the last WAL file stopped being readable
#[derive(Debug, Clone, PartialEq)]
pub struct TailTruncation {
    pub file: PathBuf,
    /// End of the last valid row
    pub offset: u64,
    pub last_lsn: Option<Lsn>,
    /// Scn of the last valid data row in the file
    pub last_scn: Option<Scn>,
    pub error: FormatError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub snapshot: Option<PathBuf>,
    pub files: usize,
    pub rows: usize,
    pub tail_truncated: Option<TailTruncation>,
}

pub struct Recovery<C: Clock> {
    ctx: Context<C>,
    state: RecoveryState,
    report: ReplayReport,
    /// File and row boundary the previous pass stopped at
    resume: Option<(PathBuf, u64)>,
}

impl<C: Clock> Recovery<C> {
    pub fn new(ctx: Context<C>) -> Self {
        Self {
            ctx,
            state: RecoveryState::LoadSnapshot,
            report: ReplayReport::default(),
            resume: None,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn report(&self) -> &ReplayReport {
        &self.report
    }

    pub fn context(&self) -> &Context<C> {
        &self.ctx
    }

    fn transition(&mut self, allowed: &[RecoveryState], to: RecoveryState) -> Result<(), RecoveryError> {
        if !allowed.contains(&self.state) {
            return Err(RecoveryError::InvalidState {
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        if self.state != to {
            tracing::info!(from = %self.state, to = %to, "recovery state");
            self.state = to;
        }
        Ok(())
    }

    /// Load the newest snapshot (or the one at `preferred`), then replay
    /// the WAL after it
    pub fn load_full(&mut self, preferred: Option<Lsn>) -> Result<BTreeMap<ShardId, Scn>, RecoveryError> {
        if self.state != RecoveryState::LoadSnapshot {
            return Err(RecoveryError::InvalidState {
                from: self.state.as_str(),
                to: RecoveryState::ReplayWal.as_str(),
            });
        }
        let snap_dir = self.ctx.snap_dir();
        let file = match preferred {
            Some(lsn) => Some(
                snap_dir
                    .files()?
                    .into_iter()
                    .find(|f| f.lsn == lsn && !f.in_progress)
                    .ok_or(RecoveryError::SnapshotMissing(lsn))?,
            ),
            None => snap_dir.latest_complete()?,
        };

        match file {
            Some(file) => {
                let ctx = self.ctx.clone();
                let summary = read_snapshot(&file.path, &mut |row| {
                    ctx.apply_row(row, ApplyMode::Snapshot)?;
                    Ok(())
                })?;
                self.ctx.set_applied_lsn(file.lsn);
                tracing::info!(
                    path = %file.path.display(),
                    shards = summary.shards,
                    rows = summary.rows,
                    "snapshot loaded"
                );
                self.report.snapshot = Some(file.path);
            }
            None => tracing::info!("no snapshot, starting empty"),
        }

        self.transition(&[RecoveryState::LoadSnapshot], RecoveryState::ReplayWal)?;
        self.load_incr(self.ctx.applied_lsn() + 1)?;
        Ok(self.ctx.scns())
    }

    /// Replay WAL rows with lsn at or after `from_lsn`
    pub fn load_incr(&mut self, from_lsn: Lsn) -> Result<&ReplayReport, RecoveryError> {
        if !matches!(self.state, RecoveryState::ReplayWal | RecoveryState::HotStandby) {
            return Err(RecoveryError::InvalidState {
                from: self.state.as_str(),
                to: RecoveryState::ReplayWal.as_str(),
            });
        }
        let files = self.ctx.wal_dir().files()?;
        let Some(last_index) = files.len().checked_sub(1) else {
            return Ok(&self.report);
        };
        let start = files.iter().rposition(|f| f.lsn <= from_lsn).unwrap_or(0);
        self.report.tail_truncated = None;

        for (index, file) in files.iter().enumerate().skip(start) {
            self.replay_file(file, from_lsn, index == last_index)?;
        }
        Ok(&self.report)
    }

    fn replay_file(&mut self, file: &LogFile, from_lsn: Lsn, is_last: bool) -> Result<(), RecoveryError> {
        let reader = XlogReader::open(&file.path, FileKind::Xlog)?;
        let offset = match &self.resume {
            Some((path, offset)) if *path == file.path => *offset,
            _ => 0,
        };
        let mut rows = reader.rows_from(offset)?;
        let mut expected = self.ctx.applied_lsn() + 1;
        let mut last_lsn = None;
        let mut last_scn = None;
        let mut applied = 0usize;
        let mut failure = None;

        for row in rows.by_ref() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            last_lsn = Some(row.lsn);
            if row.tag.kind().is_data() {
                last_scn = Some(row.scn);
            }
            if row.lsn < from_lsn || row.lsn < expected {
                continue;
            }
            if row.lsn != expected {
                tracing::warn!(expected, got = row.lsn, path = %file.path.display(), "lsn gap in wal");
            }
            self.ctx.apply_row(&row, ApplyMode::Recovery)?;
            expected = row.lsn + 1;
            applied += 1;
        }

        match rows.end() {
            ReadEnd::Broken { offset, error } if is_last => {
                tracing::warn!(
                    path = %file.path.display(),
                    offset,
                    last_lsn,
                    last_scn,
                    %error,
                    "wal tail truncated"
                );
                self.report.tail_truncated = Some(TailTruncation {
                    file: file.path.clone(),
                    offset: *offset,
                    last_lsn,
                    last_scn,
                    error: error.clone(),
                });
            }
            ReadEnd::Broken { offset, error } => {
                return Err(RecoveryError::Corrupt {
                    path: file.path.clone(),
                    offset: *offset,
                    source: error.clone(),
                });
            }
            _ => {
                if let Some(e) = failure {
                    return Err(e.into());
                }
            }
        }

        if applied > 0 {
            self.report.files += 1;
            self.report.rows += applied;
            tracing::debug!(path = %file.path.display(), rows = applied, "replayed wal file");
        }
        self.resume = Some((file.path.clone(), rows.last_valid_position()));
        Ok(())
    }

    /// Tail the local WAL directory until promoted, then become primary
    ///
    /// Rows are applied as another process appends them; a half-written
    /// row at the tail is retried on the next pass.
    pub async fn hot_standby(
        &mut self,
        delay: Duration,
        mut promote: watch::Receiver<bool>,
    ) -> Result<WalWriter, RecoveryError> {
        self.transition(
            &[RecoveryState::ReplayWal, RecoveryState::HotStandby],
            RecoveryState::HotStandby,
        )?;
        let mut watching = true;
        loop {
            self.load_incr(self.ctx.applied_lsn() + 1)?;
            if *promote.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = promote.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    }
                }
            }
        }
        tracing::info!(lsn = self.ctx.applied_lsn(), "promoted");
        self.enter_primary()
    }

    /// Seal a truncated tail and start the WAL writer
    pub fn enter_primary(&mut self) -> Result<WalWriter, RecoveryError> {
        self.transition(
            &[RecoveryState::ReplayWal, RecoveryState::HotStandby],
            RecoveryState::Primary,
        )?;
        if let Some(tail) = self.report.tail_truncated.clone() {
            let dir = self.ctx.wal_dir();
            if let Some(file) = dir.files()?.into_iter().find(|f| f.path == tail.file) {
                seal_tail(dir, &file, tail.offset)?;
            }
        }
        self.resume = None;
        let wal = self.ctx.start_wal()?;
        Ok(wal)
    }

    /// Copy state under the pool lock and write it on a blocking thread
    ///
    /// Returns `None` when a snapshot at the current lsn already exists.
    pub async fn fork_and_snapshot(&self) -> Result<Option<PathBuf>, RecoveryError> {
        if !matches!(self.state, RecoveryState::Primary | RecoveryState::HotStandby) {
            return Err(RecoveryError::InvalidState {
                from: self.state.as_str(),
                to: "snapshot",
            });
        }
        let view = self.ctx.snapshot_view();
        let dir = self.ctx.snap_dir().clone();
        if dir.file_path(view.lsn, false).exists() {
            tracing::debug!(lsn = view.lsn, "snapshot already current");
            return Ok(None);
        }
        let tm = self.ctx.clock().wall();
        let path = tokio::task::spawn_blocking(move || write_snapshot(&dir, &view, tm))
            .await
            .map_err(|e| RecoveryError::Join(e.to_string()))??;
        Ok(Some(path))
    }
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
