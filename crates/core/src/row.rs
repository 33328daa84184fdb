// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary log row format with checksum verification
//!
//! Every durable change is one row: a fixed 46-byte little-endian header
//! followed by the payload.
//!
//! ```text
//! offset  size  field
//!      0     4  header_crc32c   (covers bytes 4..46)
//!      4     8  lsn
//!     12     8  scn
//!     20     2  tag
//!     22     2  shard_id
//!     24     6  aux             (remote_scn:48 | run_crc:32 + 2 pad)
//!     30     8  tm              (f64 seconds)
//!     38     4  len
//!     42     4  data_crc32c     (covers the payload only)
//!     46   len  data
//! ```
//!
//! In log files each row is preceded by [`ROW_MARKER`]; a sealed file ends
//! with [`EOF_MARKER`].

use crate::error::FormatError;
use crate::tag::Tag;
use crate::{Lsn, Scn, ShardId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the encoded row header
pub const ROW_HEADER_SIZE: usize = 46;
/// Marker written before every row in a log file
pub const ROW_MARKER: u32 = 0xba0b_abed;
/// Marker written once when a log file is sealed
pub const EOF_MARKER: u32 = 0x10ad_ab1e;
/// Largest payload a row may carry
pub const MAX_ROW_DATA: usize = 64 * 1024 * 1024;

const REMOTE_SCN_MAX: i64 = (1 << 47) - 1;

/// The 6-byte aux field: a partial remote SCN or a run-CRC value
///
/// The on-disk union carries no discriminant; the reader decides which
/// view applies from the row's tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowAux([u8; 6]);

impl RowAux {
    pub fn run_crc(crc: u32) -> Self {
        let mut raw = [0u8; 6];
        raw[..4].copy_from_slice(&crc.to_le_bytes());
        Self(raw)
    }

    /// Store the low 48 bits of a remote SCN
    pub fn remote_scn(scn: Scn) -> Self {
        let mut raw = [0u8; 6];
        raw.copy_from_slice(&scn.to_le_bytes()[..6]);
        Self(raw)
    }

    pub fn as_run_crc(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Sign-extended 48-bit remote SCN
    pub fn as_remote_scn(&self) -> Scn {
        let mut raw = [0u8; 8];
        raw[..6].copy_from_slice(&self.0);
        if self.0[5] & 0x80 != 0 {
            raw[6] = 0xff;
            raw[7] = 0xff;
        }
        i64::from_le_bytes(raw)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 6]
    }

    pub fn raw(&self) -> [u8; 6] {
        self.0
    }
}

/// A single log row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub lsn: Lsn,
    pub scn: Scn,
    pub tag: Tag,
    pub shard_id: ShardId,
    pub aux: RowAux,
    /// Wall-clock seconds since the Unix epoch
    pub tm: f64,
    pub data: Bytes,
}

impl Row {
    /// Build a row; `lsn` is assigned later by the log writer
    pub fn new(tag: Tag, shard_id: ShardId, scn: Scn, data: impl Into<Bytes>) -> Self {
        Self {
            lsn: 0,
            scn,
            tag,
            shard_id,
            aux: RowAux::default(),
            tm: 0.0,
            data: data.into(),
        }
    }

    pub fn with_aux(mut self, aux: RowAux) -> Self {
        self.aux = aux;
        self
    }

    pub fn with_tm(mut self, tm: f64) -> Self {
        self.tm = tm;
        self
    }

    pub fn with_lsn(mut self, lsn: Lsn) -> Self {
        self.lsn = lsn;
        self
    }

    /// Encoded size of this row, header included
    pub fn encoded_len(&self) -> usize {
        ROW_HEADER_SIZE + self.data.len()
    }

    /// Reject payloads the header's length field cannot describe
    pub fn check_len(&self) -> Result<u32, FormatError> {
        let len = self.data.len();
        match u32::try_from(len) {
            Ok(raw) if len <= MAX_ROW_DATA => Ok(raw),
            _ => Err(FormatError::TooLarge {
                what: "row data",
                len,
                max: MAX_ROW_DATA,
            }),
        }
    }

    /// Serialize header and payload, computing both checksums
    pub fn encode(&self) -> Result<Bytes, FormatError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded row to `buf`; nothing is written on error
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FormatError> {
        let len = self.check_len()?;
        let start = buf.len();
        buf.put_u32_le(0);
        buf.put_i64_le(self.lsn);
        buf.put_i64_le(self.scn);
        buf.put_u16_le(self.tag.raw());
        buf.put_u16_le(self.shard_id);
        buf.put_slice(&self.aux.raw());
        buf.put_f64_le(self.tm);
        buf.put_u32_le(len);
        buf.put_u32_le(crc32c::crc32c(&self.data));

        let header_crc = crc32c::crc32c(&buf[start + 4..start + ROW_HEADER_SIZE]);
        buf[start..start + 4].copy_from_slice(&header_crc.to_le_bytes());
        buf.put_slice(&self.data);
        Ok(())
    }

    /// Decode one row from the front of `input`
    ///
    /// Returns the row and the number of bytes consumed. Truncated input
    /// and checksum mismatches are reported as distinct errors so callers
    /// can tell a partial tail write from corruption.
    pub fn decode(input: &[u8]) -> Result<(Row, usize), FormatError> {
        let header = RowHeader::decode(input)?;
        let total = ROW_HEADER_SIZE + header.len as usize;
        if input.len() < total {
            return Err(FormatError::Truncated {
                what: "row data",
                need: total,
                have: input.len(),
            });
        }
        let data = Bytes::copy_from_slice(&input[ROW_HEADER_SIZE..total]);
        Ok((header.finish(data)?, total))
    }
}

/// A verified row header whose payload has not been read yet
#[derive(Debug, Clone, PartialEq)]
pub struct RowHeader {
    pub lsn: Lsn,
    pub scn: Scn,
    pub tag: Tag,
    pub shard_id: ShardId,
    pub aux: RowAux,
    pub tm: f64,
    pub len: u32,
    pub data_crc32c: u32,
}

impl RowHeader {
    /// Parse and verify the header checksum
    pub fn decode(input: &[u8]) -> Result<Self, FormatError> {
        if input.len() < ROW_HEADER_SIZE {
            return Err(FormatError::Truncated {
                what: "row header",
                need: ROW_HEADER_SIZE,
                have: input.len(),
            });
        }

        let mut buf = &input[..ROW_HEADER_SIZE];
        let expected = buf.get_u32_le();
        let calculated = crc32c::crc32c(&input[4..ROW_HEADER_SIZE]);
        if expected != calculated {
            return Err(FormatError::HeaderChecksum {
                expected,
                calculated,
            });
        }

        let lsn = buf.get_i64_le();
        let scn = buf.get_i64_le();
        let tag = Tag::from_raw(buf.get_u16_le());
        let shard_id = buf.get_u16_le();
        let mut aux = [0u8; 6];
        buf.copy_to_slice(&mut aux);
        let tm = buf.get_f64_le();
        let len = buf.get_u32_le();
        let data_crc32c = buf.get_u32_le();

        Ok(Self {
            lsn,
            scn,
            tag,
            shard_id,
            aux: RowAux(aux),
            tm,
            len,
            data_crc32c,
        })
    }

    /// Attach the payload, verifying the data checksum
    pub fn finish(self, data: Bytes) -> Result<Row, FormatError> {
        if data.len() != self.len as usize {
            return Err(FormatError::Truncated {
                what: "row data",
                need: self.len as usize,
                have: data.len(),
            });
        }
        let calculated = crc32c::crc32c(&data);
        if calculated != self.data_crc32c {
            return Err(FormatError::DataChecksum {
                expected: self.data_crc32c,
                calculated,
            });
        }
        Ok(Row {
            lsn: self.lsn,
            scn: self.scn,
            tag: self.tag,
            shard_id: self.shard_id,
            aux: self.aux,
            tm: self.tm,
            data,
        })
    }
}

/// Clamp an SCN into the range the aux field can carry
pub fn clamp_remote_scn(scn: Scn) -> Scn {
    scn.clamp(-REMOTE_SCN_MAX - 1, REMOTE_SCN_MAX)
}

#[cfg(test)]
#[path = "row_tests.rs"]
mod tests;
