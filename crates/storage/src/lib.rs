// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tl-storage: on-disk log files and directories
//!
//! Snapshot (`.snap`) and WAL (`.xlog`) files share one layout: a short
//! text header, then marker-prefixed rows, then an EOF marker once the
//! file is sealed. Files still being written carry an `.inprogress`
//! suffix; renaming it away is the only signal that a file is complete.

mod dir;
mod error;
mod header;
mod reader;
mod writer;

pub use dir::{DirLock, FileKind, LogDir, LogFile};
pub use error::LogError;
pub use header::{FileHeader, FILE_VERSION};
pub use reader::{ReadEnd, RowIter, XlogReader};
pub use writer::{seal_tail, Confirmed, XlogWriter};
