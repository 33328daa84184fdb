// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only log file writer
//!
//! Rows are buffered and tracked as "wet" until [`XlogWriter::confirm_write`]
//! flushes and fsyncs them. Only rows that fully reached the file before
//! the fsync are confirmed; anything past the flushed length is dropped
//! and the file is cut back so the next append starts on a row boundary.

use crate::dir::{LogDir, LogFile};
use crate::error::LogError;
use crate::header::FileHeader;
use bytes::{BufMut, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tl_core::{Lsn, Row, EOF_MARKER, ROW_MARKER};

#[derive(Debug, Clone, Copy)]
struct WetRow {
    lsn: Lsn,
    end: u64,
}

/// Result of a successful [`XlogWriter::confirm_write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmed {
    /// Rows newly confirmed by this call
    pub rows: usize,
    /// Highest confirmed lsn in the file, if any row is confirmed
    pub lsn: Option<Lsn>,
}

pub struct XlogWriter {
    dir: LogDir,
    first_lsn: Lsn,
    path: PathBuf,
    file: Option<File>,
    buf: BytesMut,
    /// File offset of the first byte in `buf`
    flushed: u64,
    /// End of the last confirmed row
    confirmed_end: u64,
    confirmed_lsn: Option<Lsn>,
    next_lsn: Lsn,
    wet: Vec<WetRow>,
    rows: usize,
}

impl XlogWriter {
    /// Create `<lsn>.<suffix>.inprogress` and write its header
    pub fn create(dir: &LogDir, first_lsn: Lsn, header: &FileHeader) -> Result<Self, LogError> {
        let path = dir.file_path(first_lsn, true);
        if dir.file_path(first_lsn, false).exists() {
            return Err(LogError::Exists(dir.file_path(first_lsn, false)));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let text = header.encode();
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        dir.sync()?;

        tracing::debug!(path = %path.display(), first_lsn, "created log file");
        let offset = text.len() as u64;
        Ok(Self {
            dir: dir.clone(),
            first_lsn,
            path,
            file: Some(file),
            buf: BytesMut::new(),
            flushed: offset,
            confirmed_end: offset,
            confirmed_lsn: None,
            next_lsn: first_lsn,
            wet: Vec::new(),
            rows: 0,
        })
    }

    /// Reopen an in-progress file for appending after its last valid row
    ///
    /// `valid_end` and `last_lsn` come from a reader pass over the file.
    pub fn reopen(
        dir: &LogDir,
        file: &LogFile,
        valid_end: u64,
        last_lsn: Option<Lsn>,
        rows: usize,
    ) -> Result<Self, LogError> {
        let mut handle = OpenOptions::new().write(true).open(&file.path)?;
        handle.set_len(valid_end)?;
        handle.seek(SeekFrom::Start(valid_end))?;
        handle.sync_all()?;
        Ok(Self {
            dir: dir.clone(),
            first_lsn: file.lsn,
            path: file.path.clone(),
            file: Some(handle),
            buf: BytesMut::new(),
            flushed: valid_end,
            confirmed_end: valid_end,
            confirmed_lsn: last_lsn,
            next_lsn: last_lsn.map(|l| l + 1).unwrap_or(file.lsn),
            wet: Vec::new(),
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// Lsn the next appended row must carry
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Rows appended to this file, confirmed or not
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn wet_rows(&self) -> usize {
        self.wet.len()
    }

    pub fn confirmed_lsn(&self) -> Option<Lsn> {
        self.confirmed_lsn
    }

    /// Buffer a row; returns the file offset of its marker
    pub fn append(&mut self, row: &Row) -> Result<u64, LogError> {
        if self.file.is_none() {
            return Err(LogError::Closed);
        }
        if row.lsn != self.next_lsn {
            return Err(LogError::LsnOrder {
                expected: self.next_lsn,
                got: row.lsn,
            });
        }
        row.check_len().map_err(|e| LogError::format(&self.path, e))?;
        let offset = self.flushed + self.buf.len() as u64;
        self.buf.put_u32_le(ROW_MARKER);
        row.encode_into(&mut self.buf)
            .map_err(|e| LogError::format(&self.path, e))?;
        self.wet.push(WetRow {
            lsn: row.lsn,
            end: self.flushed + self.buf.len() as u64,
        });
        self.next_lsn += 1;
        self.rows += 1;
        Ok(offset)
    }

    /// Write buffered bytes to the file without fsync
    pub fn flush(&mut self) -> Result<(), LogError> {
        let file = self.file.as_mut().ok_or(LogError::Closed)?;
        while !self.buf.is_empty() {
            match file.write(&self.buf) {
                Ok(0) => {
                    return Err(LogError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "log file accepted no bytes",
                    )))
                }
                Ok(n) => {
                    let _ = self.buf.split_to(n);
                    self.flushed += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Flush, fsync, and confirm every wet row that reached the file
    ///
    /// On a write error the rows that did reach the file are still synced
    /// and confirmed; the rest are dropped and must be appended again.
    pub fn confirm_write(&mut self) -> Result<Confirmed, LogError> {
        let flush_result = self.flush();
        let file = self.file.as_mut().ok_or(LogError::Closed)?;
        file.sync_data()?;

        let durable = self.flushed;
        let done = self.wet.iter().take_while(|w| w.end <= durable).count();
        let confirmed: Vec<WetRow> = self.wet.drain(..done).collect();
        if let Some(last) = confirmed.last() {
            self.confirmed_end = last.end;
            self.confirmed_lsn = Some(last.lsn);
        }

        if let Err(e) = flush_result {
            let dropped = self.wet.len();
            tracing::warn!(
                path = %self.path.display(),
                dropped,
                error = %e,
                "partial write, dropping unconfirmed rows"
            );
            self.rows -= dropped;
            self.wet.clear();
            self.buf.clear();
            file.set_len(self.confirmed_end)?;
            file.seek(SeekFrom::Start(self.confirmed_end))?;
            self.flushed = self.confirmed_end;
            self.next_lsn = self.confirmed_lsn.map(|l| l + 1).unwrap_or(self.first_lsn);
            return Err(e);
        }

        Ok(Confirmed {
            rows: confirmed.len(),
            lsn: self.confirmed_lsn,
        })
    }

    /// Confirm pending rows, write the EOF marker, fsync and drop the
    /// in-progress suffix
    pub fn close(mut self) -> Result<PathBuf, LogError> {
        self.confirm_write()?;
        let mut file = self.file.take().ok_or(LogError::Closed)?;
        file.write_all(&EOF_MARKER.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        let sealed = self.dir.file_path(self.first_lsn, false);
        std::fs::rename(&self.path, &sealed)?;
        self.dir.sync()?;
        tracing::info!(path = %sealed.display(), rows = self.rows, "sealed log file");
        Ok(sealed)
    }

    /// Leave the file in progress; used when the process is stopping
    /// without sealing, as a crash would
    pub fn abandon(mut self) {
        self.file.take();
    }
}

/// Cut a file at its last valid row, append the EOF marker and seal it
///
/// Used on promotion for the WAL tail found during recovery.
pub fn seal_tail(dir: &LogDir, file: &LogFile, valid_end: u64) -> Result<PathBuf, LogError> {
    let mut handle = OpenOptions::new().write(true).open(&file.path)?;
    let old_len = handle.metadata()?.len();
    handle.set_len(valid_end)?;
    handle.seek(SeekFrom::Start(valid_end))?;
    handle.write_all(&EOF_MARKER.to_le_bytes())?;
    handle.sync_all()?;
    drop(handle);

    let sealed = dir.file_path(file.lsn, false);
    if file.path != sealed {
        std::fs::rename(&file.path, &sealed)?;
    }
    dir.sync()?;
    tracing::warn!(
        path = %sealed.display(),
        truncated = old_len.saturating_sub(valid_end),
        "sealed truncated log tail"
    );
    Ok(sealed)
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
