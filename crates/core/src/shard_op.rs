// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shard create/alter/final payloads

use crate::error::FormatError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum replicas per shard
pub const MAX_PEERS: usize = 5;
/// Width of a fixed name field; names hold at most `NAME_LEN - 1` bytes
pub const NAME_LEN: usize = 16;
const VERSION: u8 = 1;
const FIXED_LEN: usize = 1 + 1 + 4 + NAME_LEN + NAME_LEN * MAX_PEERS + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardType {
    /// Primary-or-replica: one writer, replicas pull its WAL
    Por,
    Paxos,
    Raft,
}

impl ShardType {
    fn code(self) -> u8 {
        match self {
            ShardType::Por => 0,
            ShardType::Paxos => 1,
            ShardType::Raft => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self, FormatError> {
        match code {
            0 => Ok(ShardType::Por),
            1 => Ok(ShardType::Paxos),
            2 => Ok(ShardType::Raft),
            other => Err(FormatError::BadPayload(format!(
                "unknown shard type {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ShardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardType::Por => f.write_str("por"),
            ShardType::Paxos => f.write_str("paxos"),
            ShardType::Raft => f.write_str("raft"),
        }
    }
}

/// Body of a `shard_create`, `shard_alter` or `shard_final` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOp {
    pub shard_type: ShardType,
    /// Rows that follow in a snapshot; zero in the WAL
    pub row_count: u32,
    pub module: String,
    /// Ordered peer names; the first is the initial leader or primary
    pub peers: Vec<String>,
    pub aux: Bytes,
}

impl ShardOp {
    pub fn new(shard_type: ShardType, module: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            shard_type,
            row_count: 0,
            module: module.into(),
            peers,
            aux: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, FormatError> {
        if self.peers.len() > MAX_PEERS {
            return Err(FormatError::BadPayload(format!(
                "{} peers exceeds limit of {}",
                self.peers.len(),
                MAX_PEERS
            )));
        }
        let aux_len = u16::try_from(self.aux.len())
            .map_err(|_| FormatError::BadPayload("aux too long".to_string()))?;

        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.aux.len());
        buf.put_u8(VERSION);
        buf.put_u8(self.shard_type.code());
        buf.put_u32_le(self.row_count);
        put_name(&mut buf, &self.module)?;
        for i in 0..MAX_PEERS {
            put_name(&mut buf, self.peers.get(i).map(String::as_str).unwrap_or(""))?;
        }
        buf.put_u16_le(aux_len);
        buf.put_slice(&self.aux);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, FormatError> {
        if input.len() < FIXED_LEN {
            return Err(FormatError::Truncated {
                what: "shard op",
                need: FIXED_LEN,
                have: input.len(),
            });
        }
        let version = input.get_u8();
        if version != VERSION {
            return Err(FormatError::BadPayload(format!(
                "unsupported shard op version {}",
                version
            )));
        }
        let shard_type = ShardType::from_code(input.get_u8())?;
        let row_count = input.get_u32_le();
        let module = get_name(&mut input)?;
        let mut peers = Vec::new();
        for _ in 0..MAX_PEERS {
            let peer = get_name(&mut input)?;
            if !peer.is_empty() {
                peers.push(peer);
            }
        }
        let aux_len = input.get_u16_le() as usize;
        if input.len() < aux_len {
            return Err(FormatError::Truncated {
                what: "shard op aux",
                need: aux_len,
                have: input.len(),
            });
        }
        let aux = Bytes::copy_from_slice(&input[..aux_len]);

        Ok(Self {
            shard_type,
            row_count,
            module,
            peers,
            aux,
        })
    }
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), FormatError> {
    if name.len() >= NAME_LEN {
        return Err(FormatError::BadPayload(format!(
            "name {:?} longer than {} bytes",
            name,
            NAME_LEN - 1
        )));
    }
    let mut field = [0u8; NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    buf.put_slice(&field);
    Ok(())
}

fn get_name(input: &mut &[u8]) -> Result<String, FormatError> {
    let mut field = [0u8; NAME_LEN];
    input.copy_to_slice(&mut field);
    let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8(field[..end].to_vec())
        .map_err(|_| FormatError::BadPayload("name is not utf-8".to_string()))
}

#[cfg(test)]
#[path = "shard_op_tests.rs"]
mod tests;
