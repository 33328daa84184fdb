// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log file reader with tail detection
//!
//! A reader validates the file header up front; a bad header is an error
//! from [`XlogReader::open`]. Row iteration stops at the first problem and
//! records how the file ended, so callers can tell a sealed file from an
//! open tail or a broken row, and where the last valid row ends.

use crate::dir::FileKind;
use crate::error::LogError;
use crate::header::FileHeader;
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tl_core::{FormatError, Row, RowHeader, EOF_MARKER, MAX_ROW_DATA, ROW_HEADER_SIZE, ROW_MARKER};

/// How row iteration ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEnd {
    /// Still iterating
    Pending,
    /// EOF marker found: the file was sealed
    Sealed,
    /// Clean end on a row boundary without an EOF marker
    Open,
    /// A partial or corrupt row starts at `offset`
    Broken { offset: u64, error: FormatError },
}

impl ReadEnd {
    pub fn is_broken(&self) -> bool {
        matches!(self, ReadEnd::Broken { .. })
    }
}

pub struct XlogReader {
    path: PathBuf,
    header: FileHeader,
    header_len: u64,
}

impl XlogReader {
    pub fn open(path: &Path, kind: FileKind) -> Result<Self, LogError> {
        let mut input = BufReader::new(File::open(path)?);
        let (header, header_len) =
            FileHeader::read(&mut input, kind).map_err(|e| LogError::format(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            header_len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Byte offset of the first row marker
    pub fn header_len(&self) -> u64 {
        self.header_len
    }

    /// Iterate every row from the start of the file
    pub fn rows(&self) -> Result<RowIter, LogError> {
        self.rows_from(self.header_len)
    }

    /// Iterate rows starting at `offset`, which must be a row boundary
    /// previously reported by [`RowIter::last_valid_position`]
    pub fn rows_from(&self, offset: u64) -> Result<RowIter, LogError> {
        let mut file = File::open(&self.path)?;
        let offset = offset.max(self.header_len);
        file.seek(SeekFrom::Start(offset))?;
        Ok(RowIter {
            path: self.path.clone(),
            input: BufReader::new(file),
            position: offset,
            last_valid_position: offset,
            end: ReadEnd::Pending,
        })
    }
}

/// Iterator over the rows of one file
pub struct RowIter {
    path: PathBuf,
    input: BufReader<File>,
    position: u64,
    last_valid_position: u64,
    end: ReadEnd,
}

impl RowIter {
    /// Offset just past the last row returned
    pub fn last_valid_position(&self) -> u64 {
        self.last_valid_position
    }

    pub fn end(&self) -> &ReadEnd {
        &self.end
    }

    /// Fill `buf`, returning how many bytes were available
    fn read_full(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }

    fn broken(&mut self, error: FormatError) -> Option<Result<Row, LogError>> {
        self.end = ReadEnd::Broken {
            offset: self.last_valid_position,
            error: error.clone(),
        };
        Some(Err(LogError::format(&self.path, error)))
    }

    fn truncated(&mut self, what: &'static str, need: usize, have: usize) -> Option<Result<Row, LogError>> {
        self.broken(FormatError::Truncated { what, need, have })
    }
}

impl Iterator for RowIter {
    type Item = Result<Row, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end != ReadEnd::Pending {
            return None;
        }

        let mut marker = [0u8; 4];
        let n = match self.read_full(&mut marker) {
            Ok(n) => n,
            Err(e) => return Some(Err(e.into())),
        };
        match n {
            0 => {
                self.end = ReadEnd::Open;
                return None;
            }
            4 => {}
            have => return self.truncated("row marker", 4, have),
        }
        let marker = u32::from_le_bytes(marker);
        if marker == EOF_MARKER {
            self.end = ReadEnd::Sealed;
            return None;
        }
        if marker != ROW_MARKER {
            return self.broken(FormatError::BadMarker {
                expected: ROW_MARKER,
                got: marker,
            });
        }

        let mut raw = [0u8; ROW_HEADER_SIZE];
        match self.read_full(&mut raw) {
            Ok(n) if n == ROW_HEADER_SIZE => {}
            Ok(have) => return self.truncated("row header", ROW_HEADER_SIZE, have),
            Err(e) => return Some(Err(e.into())),
        }
        let header = match RowHeader::decode(&raw) {
            Ok(h) => h,
            Err(e) => return self.broken(e),
        };

        let len = header.len as usize;
        if len > MAX_ROW_DATA {
            return self.broken(FormatError::TooLarge {
                what: "row data",
                len,
                max: MAX_ROW_DATA,
            });
        }
        let mut data = vec![0u8; len];
        match self.read_full(&mut data) {
            Ok(n) if n == len => {}
            Ok(have) => return self.truncated("row data", len, have),
            Err(e) => return Some(Err(e.into())),
        }
        match header.finish(Bytes::from(data)) {
            Ok(row) => {
                self.last_valid_position = self.position;
                Some(Ok(row))
            }
            Err(e) => self.broken(e),
        }
    }
}

#[cfg(test)]
#[path = "reader_tests.rs"]
mod tests;
