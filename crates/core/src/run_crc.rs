// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rolling run-CRC divergence detector
//!
//! Every data row confirmed on a shard folds its payload into a running
//! CRC32. The last [`RUN_CRC_HISTORY`] values are kept keyed by SCN so a
//! `run_crc` row written by the primary can be checked against the local
//! value at the same SCN. A mismatch is sticky and only reported.

use crate::tag::Tag;
use crate::Scn;
use std::collections::VecDeque;
use std::fmt;

/// Number of `(scn, crc)` pairs retained for verification
pub const RUN_CRC_HISTORY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCrcEntry {
    pub scn: Scn,
    pub crc: u32,
}

/// Outcome of checking a declared run-CRC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch { local: u32 },
    /// The SCN is outside the retained history
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCrcStatus {
    /// Nothing verified yet
    None,
    Ok,
    Mismatch,
}

impl RunCrcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunCrcStatus::None => "none",
            RunCrcStatus::Ok => "ok",
            RunCrcStatus::Mismatch => "mismatch",
        }
    }
}

impl fmt::Display for RunCrcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fold one row into a running CRC; non-data rows leave it unchanged
pub fn run_crc_calc(crc: u32, tag: Tag, data: &[u8]) -> u32 {
    if !tag.kind().is_data() {
        return crc;
    }
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

#[derive(Debug, Clone)]
pub struct RunCrc {
    log: u32,
    /// Executor-side value, carried in snapshots alongside the log value
    module: u32,
    history: VecDeque<RunCrcEntry>,
    mismatch: bool,
    verified_at: Option<f64>,
}

impl Default for RunCrc {
    fn default() -> Self {
        Self::new(0)
    }
}

impl RunCrc {
    pub fn new(initial: u32) -> Self {
        Self {
            log: initial,
            module: 0,
            history: VecDeque::with_capacity(RUN_CRC_HISTORY),
            mismatch: false,
            verified_at: None,
        }
    }

    pub fn value(&self) -> u32 {
        self.log
    }

    pub fn module_value(&self) -> u32 {
        self.module
    }

    pub fn set_module_value(&mut self, crc: u32) {
        self.module = crc;
    }

    /// Fold a confirmed row at `scn` and remember the result
    pub fn update(&mut self, scn: Scn, tag: Tag, data: &[u8]) -> u32 {
        self.log = run_crc_calc(self.log, tag, data);
        self.record(RunCrcEntry { scn, crc: self.log });
        self.log
    }

    pub fn record(&mut self, entry: RunCrcEntry) {
        if let Some(last) = self.history.back_mut() {
            if last.scn == entry.scn {
                last.crc = entry.crc;
                return;
            }
        }
        if self.history.len() == RUN_CRC_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    /// Compare a declared CRC at `scn` with the local history
    pub fn verify(&mut self, scn: Scn, declared: u32, now: f64) -> Verification {
        let Some(entry) = self.history.iter().rev().find(|e| e.scn <= scn) else {
            return Verification::Unknown;
        };
        // The newest entry at or below scn holds the value at scn only if
        // the history has not been trimmed past it.
        if entry.scn != scn && self.history.front().is_some_and(|f| f.scn > scn) {
            return Verification::Unknown;
        }
        self.verified_at = Some(now);
        if entry.crc == declared {
            Verification::Match
        } else {
            if !self.mismatch {
                tracing::error!(
                    scn,
                    declared = format_args!("{:#010x}", declared),
                    local = format_args!("{:#010x}", entry.crc),
                    "run_crc mismatch"
                );
            }
            self.mismatch = true;
            Verification::Mismatch { local: entry.crc }
        }
    }

    /// Seconds since the last successful comparison
    pub fn lag(&self, now: f64) -> Option<f64> {
        self.verified_at.map(|at| (now - at).max(0.0))
    }

    pub fn status(&self) -> RunCrcStatus {
        match (self.mismatch, self.verified_at) {
            (true, _) => RunCrcStatus::Mismatch,
            (false, Some(_)) => RunCrcStatus::Ok,
            (false, None) => RunCrcStatus::None,
        }
    }

    pub fn is_mismatch(&self) -> bool {
        self.mismatch
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
#[path = "run_crc_tests.rs"]
mod tests;
