// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tl_core::{ErrorClass, FormatError, Lsn};

/// Errors from log files and directories
#[derive(Debug, Error)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: FormatError,
    },
    #[error("directory {0} is locked by another process")]
    Locked(PathBuf),
    #[error("lsn out of order: expected {expected}, got {got}")]
    LsnOrder { expected: Lsn, got: Lsn },
    #[error("log file {0} already exists")]
    Exists(PathBuf),
    #[error("writer is closed")]
    Closed,
}

impl LogError {
    pub fn format(path: impl Into<PathBuf>, source: FormatError) -> Self {
        LogError::Format {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            LogError::Format { .. } | LogError::LsnOrder { .. } => ErrorClass::Format,
            LogError::Io(_) | LogError::Locked(_) | LogError::Exists(_) | LogError::Closed => {
                ErrorClass::TransientIo
            }
        }
    }
}
