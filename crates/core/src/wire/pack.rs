// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WAL pack request and reply frames
//!
//! ```text
//! request: packet_len:u32 row_count:u32 magic:u32 seq:i64 epoch:i64 rows...
//! reply:   packet_len:u32 row_count:u32 seq:i64 epoch:i64 lsn:i64
//! ```

use super::need;
use crate::error::FormatError;
use crate::row::Row;
use crate::Lsn;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const WAL_REQUEST_MAGIC: u32 = 0xba0b_abed;
pub const WAL_REQUEST_HEADER_LEN: usize = 4 + 4 + 4 + 8 + 8;
pub const WAL_REPLY_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8;

/// A pack of rows sent to the durability worker
#[derive(Debug, Clone, PartialEq)]
pub struct WalRequest {
    pub seq: i64,
    pub epoch: i64,
    pub rows: Vec<Row>,
}

impl WalRequest {
    pub fn encode(&self) -> Result<Bytes, FormatError> {
        let body: usize = self.rows.iter().map(Row::encoded_len).sum();
        let mut buf = BytesMut::with_capacity(WAL_REQUEST_HEADER_LEN + body);
        buf.put_u32_le((WAL_REQUEST_HEADER_LEN + body) as u32);
        buf.put_u32_le(self.rows.len() as u32);
        buf.put_u32_le(WAL_REQUEST_MAGIC);
        buf.put_i64_le(self.seq);
        buf.put_i64_le(self.epoch);
        for row in &self.rows {
            row.encode_into(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(input: &[u8]) -> Result<Self, FormatError> {
        need("wal request header", WAL_REQUEST_HEADER_LEN, input.len())?;
        let mut hdr = &input[..WAL_REQUEST_HEADER_LEN];
        let packet_len = hdr.get_u32_le() as usize;
        let row_count = hdr.get_u32_le() as usize;
        let magic = hdr.get_u32_le();
        if magic != WAL_REQUEST_MAGIC {
            return Err(FormatError::BadMarker {
                expected: WAL_REQUEST_MAGIC,
                got: magic,
            });
        }
        let seq = hdr.get_i64_le();
        let epoch = hdr.get_i64_le();
        need("wal request", packet_len, input.len())?;

        let mut rest = &input[WAL_REQUEST_HEADER_LEN..packet_len];
        let mut rows = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let (row, used) = Row::decode(rest)?;
            rows.push(row);
            rest = &rest[used..];
        }
        Ok(Self { seq, epoch, rows })
    }
}

/// Acknowledgment for one pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalReply {
    pub row_count: u32,
    pub seq: i64,
    pub epoch: i64,
    /// Highest durable lsn after this pack
    pub lsn: Lsn,
}

impl WalReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(WAL_REPLY_HEADER_LEN);
        buf.put_u32_le(WAL_REPLY_HEADER_LEN as u32);
        buf.put_u32_le(self.row_count);
        buf.put_i64_le(self.seq);
        buf.put_i64_le(self.epoch);
        buf.put_i64_le(self.lsn);
        buf.freeze()
    }

    pub fn decode(input: &[u8]) -> Result<Self, FormatError> {
        need("wal reply", WAL_REPLY_HEADER_LEN, input.len())?;
        let mut buf = input;
        let packet_len = buf.get_u32_le() as usize;
        if packet_len != WAL_REPLY_HEADER_LEN {
            return Err(FormatError::BadPayload(format!(
                "wal reply length {}",
                packet_len
            )));
        }
        Ok(Self {
            row_count: buf.get_u32_le(),
            seq: buf.get_i64_le(),
            epoch: buf.get_i64_le(),
            lsn: buf.get_i64_le(),
        })
    }
}

#[cfg(test)]
#[path = "pack_tests.rs"]
mod tests;
