// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `tl verify`: check every row of a file or directory
//!
//! A broken row is fatal except at the tail of the newest WAL file, where
//! a crash can legitimately leave a partial write. Complete snapshots
//! must open with `snap_initial` and close with `snap_final`.

use anyhow::{bail, Result};
use clap::Args;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tl_core::TagKind;
use tl_storage::{FileKind, ReadEnd};

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct VerifyArgs {
    /// Log directory or single file
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Ok,
    /// Partial row at the end of the newest WAL file
    Tail { offset: u64, error: String },
    /// Unfinished snapshot, ignored by recovery
    Incomplete { reason: String },
    Corrupt { offset: u64, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub rows: usize,
    pub first_lsn: Option<i64>,
    pub last_lsn: Option<i64>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl FileReport {
    pub fn is_corrupt(&self) -> bool {
        matches!(self.verdict, Verdict::Corrupt { .. })
    }
}

impl fmt::Display for FileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lsns = match (self.first_lsn, self.last_lsn) {
            (Some(first), Some(last)) => format!("lsn:{}..{}", first, last),
            _ => "empty".to_string(),
        };
        match &self.verdict {
            Verdict::Ok => write!(f, "ok      {} rows:{} {}", self.path.display(), self.rows, lsns),
            Verdict::Tail { offset, error } => write!(
                f,
                "tail    {} rows:{} {} truncated at {}: {}",
                self.path.display(),
                self.rows,
                lsns,
                offset,
                error
            ),
            Verdict::Incomplete { reason } => {
                write!(f, "partial {} rows:{}: {}", self.path.display(), self.rows, reason)
            }
            Verdict::Corrupt { offset, error } => write!(
                f,
                "CORRUPT {} rows:{} at {}: {}",
                self.path.display(),
                self.rows,
                offset,
                error
            ),
        }
    }
}

pub fn verify(args: VerifyArgs, format: OutputFormat) -> Result<()> {
    let reports = verify_path(&args.path)?;
    output::print_list(&reports, format);
    let corrupt = reports.iter().filter(|r| r.is_corrupt()).count();
    if corrupt > 0 {
        bail!("{} of {} files corrupt", corrupt, reports.len());
    }
    Ok(())
}

pub fn verify_path(path: &Path) -> Result<Vec<FileReport>> {
    if !path.is_dir() {
        let kind = super::file_kind(path)?;
        let in_progress = path.extension().is_some_and(|e| e == "inprogress");
        return Ok(vec![verify_file(path, kind, in_progress)]);
    }
    let files = super::list(path)?;
    let last_wal = files
        .iter()
        .rposition(|(kind, _)| *kind == FileKind::Xlog);
    Ok(files
        .iter()
        .enumerate()
        .map(|(index, (kind, file))| {
            let tail = *kind == FileKind::Xlog && Some(index) == last_wal;
            verify_file(&file.path, *kind, tail || file.in_progress)
        })
        .collect())
}

/// Check one file; `lenient` marks the newest WAL file or an unfinished
/// snapshot, where a broken end is expected after a crash
pub fn verify_file(path: &Path, kind: FileKind, lenient: bool) -> FileReport {
    let mut report = FileReport {
        path: path.to_path_buf(),
        rows: 0,
        first_lsn: None,
        last_lsn: None,
        verdict: Verdict::Ok,
    };
    let rows = super::open(path).and_then(|reader| reader.rows().map_err(Into::into));
    let mut rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            report.verdict = Verdict::Corrupt {
                offset: 0,
                error: format!("{:#}", e),
            };
            return report;
        }
    };

    let mut first_tag = None;
    let mut last_tag = None;
    let mut disorder = None;
    let mut failure = None;
    loop {
        let at = rows.last_valid_position();
        let row = match rows.next() {
            Some(Ok(row)) => row,
            Some(Err(e)) => {
                failure = Some((at, e.to_string()));
                break;
            }
            None => break,
        };
        if let Some(last) = report.last_lsn {
            if row.lsn <= last && disorder.is_none() {
                disorder = Some((at, format!("lsn {} follows lsn {}", row.lsn, last)));
            }
        }
        report.first_lsn.get_or_insert(row.lsn);
        report.last_lsn = Some(row.lsn);
        first_tag.get_or_insert(row.tag.kind());
        last_tag = Some(row.tag.kind());
        report.rows += 1;
    }

    report.verdict = match (rows.end(), kind) {
        (ReadEnd::Broken { offset, error }, FileKind::Snap) if lenient => Verdict::Incomplete {
            reason: format!("broken at {}: {}", offset, error),
        },
        (ReadEnd::Broken { offset, error }, _) if lenient => Verdict::Tail {
            offset: *offset,
            error: error.to_string(),
        },
        (ReadEnd::Broken { offset, error }, _) => Verdict::Corrupt {
            offset: *offset,
            error: error.to_string(),
        },
        _ => match failure {
            Some((offset, error)) => Verdict::Corrupt { offset, error },
            None => Verdict::Ok,
        },
    };
    if let (Some((offset, error)), false) = (disorder, report.is_corrupt()) {
        report.verdict = Verdict::Corrupt { offset, error };
    }
    if kind == FileKind::Snap && report.verdict == Verdict::Ok {
        let framing = if first_tag != Some(TagKind::SnapInitial) {
            Some("does not start with snap_initial")
        } else if last_tag != Some(TagKind::SnapFinal) {
            Some("is missing snap_final")
        } else {
            None
        };
        if let Some(problem) = framing {
            let error = format!("snapshot {}", problem);
            report.verdict = if lenient {
                Verdict::Incomplete { reason: error }
            } else {
                Verdict::Corrupt {
                    offset: rows.last_valid_position(),
                    error,
                }
            };
        }
    }
    report
}

#[cfg(test)]
#[path = "verify_tests.rs"]
mod tests;
