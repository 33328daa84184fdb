// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Format errors and the error class taxonomy exposed in status strings

use std::fmt;
use thiserror::Error;

/// Errors from decoding rows, file headers and wire structures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("header crc32c mismatch: expected {expected:#010x}, calculated {calculated:#010x}")]
    HeaderChecksum { expected: u32, calculated: u32 },
    #[error("data crc32c mismatch: expected {expected:#010x}, calculated {calculated:#010x}")]
    DataChecksum { expected: u32, calculated: u32 },
    #[error("invalid row marker: expected {expected:#010x}, got {got:#010x}")]
    BadMarker { expected: u32, got: u32 },
    #[error("invalid tag {0:#06x}")]
    BadTag(u16),
    #[error("invalid file header: {0}")]
    BadFileHeader(String),
    #[error("invalid payload: {0}")]
    BadPayload(String),
    #[error("{what} of {len} bytes exceeds the {max} byte limit")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

impl FormatError {
    /// True when the input simply ended early, as a partial write would
    pub fn is_truncation(&self) -> bool {
        matches!(self, FormatError::Truncated { .. })
    }
}

/// Error classes surfaced to operators
///
/// Every subsystem error maps onto one of these so that shard status can
/// report the last error class without exposing internal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Checksum mismatch, truncated header, bad marker
    Format,
    /// Handshake version/filter mismatch, unexpected message
    Protocol,
    /// Connect refused, timeout, writer restart
    TransientIo,
    /// Higher ballot or term seen
    ConsensusConflict,
    /// Run-CRC mismatch
    Divergence,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Format => "format_error",
            ErrorClass::Protocol => "protocol_error",
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::ConsensusConflict => "consensus_conflict",
            ErrorClass::Divergence => "divergence",
        }
    }

    /// Whether the subsystem retries errors of this class on its own
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientIo | ErrorClass::ConsensusConflict
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
