// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log directories: file naming, lookup by lsn or scn, and locking

use crate::error::LogError;
use crate::header::FileHeader;
use fs2::FileExt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tl_core::{Lsn, Scn, ShardId};

const INPROGRESS_SUFFIX: &str = ".inprogress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Xlog,
    Snap,
}

impl FileKind {
    pub fn suffix(self) -> &'static str {
        match self {
            FileKind::Xlog => ".xlog",
            FileKind::Snap => ".snap",
        }
    }

    pub fn filetype(self) -> &'static str {
        match self {
            FileKind::Xlog => "XLOG",
            FileKind::Snap => "SNAP",
        }
    }
}

/// One file found in a log directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// Lsn of the first row, taken from the file name
    pub lsn: Lsn,
    pub path: PathBuf,
    pub in_progress: bool,
}

/// Exclusive flock on a log directory, released on drop
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A directory holding one kind of log file
#[derive(Debug, Clone)]
pub struct LogDir {
    path: PathBuf,
    kind: FileKind,
}

impl LogDir {
    /// Open a directory, creating it when missing
    pub fn open(path: impl Into<PathBuf>, kind: FileKind) -> Result<Self, LogError> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, kind })
    }

    pub fn wal(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        Self::open(path, FileKind::Xlog)
    }

    pub fn snap(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        Self::open(path, FileKind::Snap)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Path of the file starting at `lsn`
    pub fn file_path(&self, lsn: Lsn, in_progress: bool) -> PathBuf {
        let mut name = format!("{:020}{}", lsn, self.kind.suffix());
        if in_progress {
            name.push_str(INPROGRESS_SUFFIX);
        }
        self.path.join(name)
    }

    /// Take a non-blocking exclusive lock on the directory
    pub fn lock(&self) -> Result<DirLock, LogError> {
        let file = File::open(&self.path)?;
        file.try_lock_exclusive()
            .map_err(|_| LogError::Locked(self.path.clone()))?;
        tracing::debug!(dir = %self.path.display(), "locked log directory");
        Ok(DirLock {
            _file: file,
            path: self.path.clone(),
        })
    }

    /// Fsync the directory so renames and creations are durable
    pub fn sync(&self) -> Result<(), LogError> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    /// All files of this directory's kind, ordered by lsn
    ///
    /// When both a sealed and an in-progress file exist for one lsn, the
    /// sealed one wins.
    pub fn files(&self) -> Result<Vec<LogFile>, LogError> {
        let mut files: Vec<LogFile> = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(file) = self.parse_name(name) else {
                continue;
            };
            files.push(file);
        }
        files.sort_by(|a, b| a.lsn.cmp(&b.lsn).then(a.in_progress.cmp(&b.in_progress)));
        files.dedup_by(|later, earlier| later.lsn == earlier.lsn);
        Ok(files)
    }

    fn parse_name(&self, name: &str) -> Option<LogFile> {
        let (stem, in_progress) = match name.strip_suffix(INPROGRESS_SUFFIX) {
            Some(stem) => (stem, true),
            None => (name, false),
        };
        let digits = stem.strip_suffix(self.kind.suffix())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let lsn = digits.parse().ok()?;
        Some(LogFile {
            lsn,
            path: self.path.join(name),
            in_progress,
        })
    }

    /// First lsn of the newest file, if any
    pub fn greatest_lsn(&self) -> Result<Option<Lsn>, LogError> {
        Ok(self.files()?.last().map(|f| f.lsn))
    }

    /// The newest sealed file; snapshots still in progress are ignored
    pub fn latest_complete(&self) -> Result<Option<LogFile>, LogError> {
        Ok(self.files()?.into_iter().rev().find(|f| !f.in_progress))
    }

    /// The file whose lsn range contains `lsn`
    ///
    /// Files are keyed by their first lsn, so this is the last file
    /// starting at or before `lsn`.
    pub fn find_by_lsn(&self, lsn: Lsn) -> Result<Option<LogFile>, LogError> {
        let files = self.files()?;
        Ok(find_window(&files, |f| f.lsn, lsn).cloned())
    }

    /// The file in which `shard` advanced past `scn`
    ///
    /// Uses the `SCN-<shard>` header of each file, which records the
    /// shard's scn when the file was opened. Files without a marker for
    /// the shard are skipped.
    pub fn find_by_scn(&self, shard: ShardId, scn: Scn) -> Result<Option<LogFile>, LogError> {
        let mut marked = Vec::new();
        for file in self.files()? {
            let header = self.read_header(&file.path)?;
            if let Some(&start) = header.scns.get(&shard) {
                marked.push((start, file));
            }
        }
        Ok(find_window(&marked, |(start, _)| *start, scn).map(|(_, f)| f.clone()))
    }

    pub fn read_header(&self, path: &Path) -> Result<FileHeader, LogError> {
        let mut input = BufReader::new(File::open(path)?);
        FileHeader::read(&mut input, self.kind)
            .map(|(header, _)| header)
            .map_err(|e| LogError::format(path, e))
    }
}

/// Last element whose key is at most `target`; the first when none is
fn find_window<T>(items: &[T], key: impl Fn(&T) -> i64, target: i64) -> Option<&T> {
    let pos = items.partition_point(|item| key(item) <= target);
    if pos == 0 {
        items.first()
    } else {
        items.get(pos - 1)
    }
}

#[cfg(test)]
#[path = "dir_tests.rs"]
mod tests;
