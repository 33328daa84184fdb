// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Payloads of `run_crc` and `snap_initial` rows

use crate::error::FormatError;
use crate::Scn;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Body of a `run_crc` row: `scn:i64, crc_log:u32, crc_mod:u32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCrcRecord {
    pub scn: Scn,
    /// Rolling checksum over the shard's data rows
    pub log: u32,
    /// Executor state checksum at `scn`
    pub module: u32,
}

impl RunCrcRecord {
    pub const LEN: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_i64_le(self.scn);
        buf.put_u32_le(self.log);
        buf.put_u32_le(self.module);
        buf.freeze()
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, FormatError> {
        if input.len() < Self::LEN {
            return Err(FormatError::Truncated {
                what: "run_crc",
                need: Self::LEN,
                have: input.len(),
            });
        }
        Ok(Self {
            scn: input.get_i64_le(),
            log: input.get_u32_le(),
            module: input.get_u32_le(),
        })
    }
}

/// Body of a `snap_initial` row: `count:u32, run_crc:u32, run_crc_mod:u32`
///
/// `count` is the number of `snap_data` rows in the file; the two
/// checksums fold every shard's values in shard id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapInitial {
    pub count: u32,
    pub run_crc: u32,
    pub run_crc_mod: u32,
}

impl SnapInitial {
    pub const LEN: usize = 12;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32_le(self.count);
        buf.put_u32_le(self.run_crc);
        buf.put_u32_le(self.run_crc_mod);
        buf.freeze()
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, FormatError> {
        if input.len() < Self::LEN {
            return Err(FormatError::Truncated {
                what: "snap_initial",
                need: Self::LEN,
                have: input.len(),
            });
        }
        Ok(Self {
            count: input.get_u32_le(),
            run_crc: input.get_u32_le(),
            run_crc_mod: input.get_u32_le(),
        })
    }
}

#[cfg(test)]
#[path = "sys_row_tests.rs"]
mod tests;
