// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Text header at the start of every log file
//!
//! ```text
//! XLOG
//! 0.12
//! Created-by: tidelog
//! SCN-1: 4711
//!
//! ```

use crate::dir::FileKind;
use std::collections::BTreeMap;
use std::io::{BufRead, Read};
use tl_core::{FormatError, Scn, ShardId};

pub const FILE_VERSION: &str = "0.12";
const MAX_HEADER_LINE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub kind: FileKind,
    /// Free-form `Key: value` lines other than SCN markers, in order
    pub fields: Vec<(String, String)>,
    /// Per-shard SCN at the start of the file
    pub scns: BTreeMap<ShardId, Scn>,
}

impl FileHeader {
    pub fn new(kind: FileKind) -> Self {
        Self {
            kind,
            fields: vec![("Created-by".to_string(), "tidelog".to_string())],
            scns: BTreeMap::new(),
        }
    }

    pub fn with_scn(mut self, shard: ShardId, scn: Scn) -> Self {
        self.scns.insert(shard, scn);
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.kind.filetype());
        out.push('\n');
        out.push_str(FILE_VERSION);
        out.push('\n');
        for (key, value) in &self.fields {
            out.push_str(&format!("{}: {}\n", key, value));
        }
        for (shard, scn) in &self.scns {
            out.push_str(&format!("SCN-{}: {}\n", shard, scn));
        }
        out.push('\n');
        out
    }

    /// Parse a header, returning it with the number of bytes consumed
    pub fn read<R: BufRead>(input: &mut R, expected: FileKind) -> Result<(Self, u64), FormatError> {
        let mut consumed = 0u64;
        let mut line = String::new();

        consumed += read_line(input, &mut line)?;
        if line != expected.filetype() {
            return Err(FormatError::BadFileHeader(format!(
                "expected filetype {}, got {:?}",
                expected.filetype(),
                line
            )));
        }

        consumed += read_line(input, &mut line)?;
        if line != FILE_VERSION {
            return Err(FormatError::BadFileHeader(format!(
                "unsupported version {:?}",
                line
            )));
        }

        let mut header = FileHeader {
            kind: expected,
            fields: Vec::new(),
            scns: BTreeMap::new(),
        };
        loop {
            consumed += read_line(input, &mut line)?;
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(FormatError::BadFileHeader(format!(
                    "malformed header line {:?}",
                    line
                )));
            };
            let value = value.trim();
            if let Some(shard) = key.strip_prefix("SCN-") {
                let shard = shard.parse::<ShardId>().map_err(|_| {
                    FormatError::BadFileHeader(format!("bad shard id in {:?}", line))
                })?;
                let scn = value
                    .parse::<Scn>()
                    .map_err(|_| FormatError::BadFileHeader(format!("bad scn in {:?}", line)))?;
                header.scns.insert(shard, scn);
            } else {
                header.fields.push((key.to_string(), value.to_string()));
            }
        }
        Ok((header, consumed))
    }
}

/// Read one `\n`-terminated line into `line` without the newline
fn read_line<R: BufRead>(input: &mut R, line: &mut String) -> Result<u64, FormatError> {
    line.clear();
    let mut raw = Vec::new();
    let n = input
        .take(MAX_HEADER_LINE as u64)
        .read_until(b'\n', &mut raw)
        .map_err(|e| FormatError::BadFileHeader(e.to_string()))?;
    if n == 0 || raw.last() != Some(&b'\n') {
        return Err(FormatError::BadFileHeader(
            "header ends before blank line".to_string(),
        ));
    }
    raw.pop();
    *line = String::from_utf8(raw)
        .map_err(|_| FormatError::BadFileHeader("header is not utf-8".to_string()))?;
    Ok(n as u64)
}

#[cfg(test)]
#[path = "header_tests.rs"]
mod tests;
