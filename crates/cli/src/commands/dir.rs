// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `tl dir`: list the log files in a directory

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct DirArgs {
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub kind: &'static str,
    pub lsn: i64,
    pub in_progress: bool,
    pub path: PathBuf,
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:>20}", self.kind, self.lsn)?;
        if self.in_progress {
            f.write_str(" inprogress")?;
        }
        write!(f, " {}", self.path.display())
    }
}

pub fn dir(args: DirArgs, format: OutputFormat) -> Result<()> {
    let entries: Vec<FileEntry> = super::list(&args.path)?
        .into_iter()
        .map(|(kind, file)| FileEntry {
            kind: kind.filetype(),
            lsn: file.lsn,
            in_progress: file.in_progress,
            path: file.path,
        })
        .collect();
    output::print_list(&entries, format);
    Ok(())
}
