// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-line rendering of log rows
//!
//! System payloads with a known layout are decoded; anything else is
//! shown as hex.

use serde::Serialize;
use std::fmt;
use tl_core::{KvOp, Row, RunCrcRecord, ShardOp, SnapInitial, TagKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowView {
    pub lsn: i64,
    pub shard: u16,
    pub scn: i64,
    pub tm: f64,
    pub tag: String,
    pub len: usize,
    pub detail: String,
}

impl RowView {
    pub fn new(row: &Row) -> Self {
        Self {
            lsn: row.lsn,
            shard: row.shard_id,
            scn: row.scn,
            tm: row.tm,
            tag: row.tag.to_string(),
            len: row.data.len(),
            detail: detail(row),
        }
    }
}

impl fmt::Display for RowView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lsn:{} shard:{} scn:{} tm:{:.3} t:{}",
            self.lsn, self.shard, self.scn, self.tm, self.tag
        )?;
        if !self.detail.is_empty() {
            write!(f, " {}", self.detail)?;
        }
        Ok(())
    }
}

fn detail(row: &Row) -> String {
    let decoded = match row.tag.kind() {
        TagKind::SnapInitial => SnapInitial::decode(&row.data).map(|s| {
            format!(
                "count:{} run_crc:0x{:08x} run_crc_mod:0x{:08x}",
                s.count, s.run_crc, s.run_crc_mod
            )
        }),
        TagKind::RunCrc => RunCrcRecord::decode(&row.data).map(|r| {
            format!(
                "SCN:{} log:0x{:08x} mod:0x{:08x}",
                r.scn, r.log, r.module
            )
        }),
        TagKind::ShardCreate | TagKind::ShardAlter => ShardOp::decode(&row.data).map(|op| {
            format!(
                "type:{} module:{} peers:[{}]",
                op.shard_type,
                op.module,
                op.peers.join(",")
            )
        }),
        TagKind::WalData | TagKind::SnapData => KvOp::decode(&row.data).map(|op| match op {
            KvOp::Put { key, val } => format!("put {} {}", hex(&key), hex(&val)),
            KvOp::Delete { key } => format!("delete {}", hex(&key)),
        }),
        _ => return hex(&row.data),
    };
    decoded.unwrap_or_else(|_| hex(&row.data))
}

pub fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
#[path = "render_tests.rs"]
mod tests;
