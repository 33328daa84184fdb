// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pull-based replication
//!
//! A replica connects to a feeder, sends a [`Handshake`](tl_core::Handshake)
//! naming the scn it has and an optional filter, and then reads rows in
//! on-disk framing (`ROW_MARKER` + row). The feeder interleaves `nop` ping
//! rows with lsn 0 while the source is idle.

mod feeder;
mod puller;
mod replica;

pub use feeder::{serve_feeder, Feeder, FeederConfig, RowFilter};
pub use puller::{AbortHandle, Puller};
pub use replica::{Replica, ReplicaConfig, ReplicaStatus};

use bytes::{BufMut, BytesMut};
use tl_core::{FormatError, Row, Tag, TagKind, ROW_MARKER};

/// Name of the built-in native filter selecting shards by id
pub const SHARD_FILTER: &str = "shard";

/// Out-of-band keepalive; never part of any log
pub(crate) fn ping(tm: f64) -> Row {
    Row::new(Tag::sys(TagKind::Nop), 0, 0, bytes::Bytes::new()).with_tm(tm)
}

pub fn is_ping(row: &Row) -> bool {
    row.lsn == 0 && row.tag.kind() == TagKind::Nop
}

/// Append one row in stream framing
pub(crate) fn frame_row(buf: &mut BytesMut, row: &Row) -> Result<(), FormatError> {
    row.check_len()?;
    buf.put_u32_le(ROW_MARKER);
    row.encode_into(buf)
}
