// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI command implementations

pub mod cat;
pub mod dir;
pub mod verify;

use anyhow::{bail, Context, Result};
use std::path::Path;
use tl_storage::{FileKind, LogDir, LogFile, XlogReader};

/// File kind from the name, `.inprogress` suffix allowed
pub fn file_kind(path: &Path) -> Result<FileKind> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let name = name.strip_suffix(".inprogress").unwrap_or(&name);
    if name.ends_with(FileKind::Xlog.suffix()) {
        Ok(FileKind::Xlog)
    } else if name.ends_with(FileKind::Snap.suffix()) {
        Ok(FileKind::Snap)
    } else {
        bail!("{}: not a .xlog or .snap file", path.display())
    }
}

pub fn open(path: &Path) -> Result<XlogReader> {
    let kind = file_kind(path)?;
    XlogReader::open(path, kind).with_context(|| format!("cannot open {}", path.display()))
}

/// Snapshot and WAL files in a directory, each kind in lsn order
pub fn list(path: &Path) -> Result<Vec<(FileKind, LogFile)>> {
    if !path.is_dir() {
        bail!("{}: not a directory", path.display());
    }
    let mut files = Vec::new();
    for kind in [FileKind::Snap, FileKind::Xlog] {
        let dir = LogDir::open(path, kind)?;
        files.extend(dir.files()?.into_iter().map(|f| (kind, f)));
    }
    Ok(files)
}
