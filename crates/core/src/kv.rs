// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Key/value payload interpreted by the reference executors
//!
//! `op:u8 {1 put, 2 delete}, key_len:u32, key, val_len:u32, val`

use crate::error::FormatError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: Bytes, val: Bytes },
    Delete { key: Bytes },
}

impl KvOp {
    pub fn put(key: impl Into<Bytes>, val: impl Into<Bytes>) -> Self {
        KvOp::Put {
            key: key.into(),
            val: val.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        KvOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &Bytes {
        match self {
            KvOp::Put { key, .. } | KvOp::Delete { key } => key,
        }
    }

    pub fn encode(&self) -> Bytes {
        let (op, key, val) = match self {
            KvOp::Put { key, val } => (OP_PUT, key, &val[..]),
            KvOp::Delete { key } => (OP_DELETE, key, &[][..]),
        };
        let mut buf = BytesMut::with_capacity(9 + key.len() + val.len());
        buf.put_u8(op);
        buf.put_u32_le(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32_le(val.len() as u32);
        buf.put_slice(val);
        buf.freeze()
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, FormatError> {
        if input.remaining() < 1 {
            return Err(truncated("kv op", 1, 0));
        }
        let op = input.get_u8();
        let key = take_blob(&mut input, "kv key")?;
        let val = take_blob(&mut input, "kv value")?;
        match op {
            OP_PUT => Ok(KvOp::Put { key, val }),
            OP_DELETE => Ok(KvOp::Delete { key }),
            other => Err(FormatError::BadPayload(format!("unknown kv op {}", other))),
        }
    }
}

fn take_blob(input: &mut &[u8], what: &'static str) -> Result<Bytes, FormatError> {
    if input.remaining() < 4 {
        return Err(truncated(what, 4, input.remaining()));
    }
    let len = input.get_u32_le() as usize;
    if input.remaining() < len {
        return Err(truncated(what, len, input.remaining()));
    }
    let blob = Bytes::copy_from_slice(&input[..len]);
    input.advance(len);
    Ok(blob)
}

fn truncated(what: &'static str, need: usize, have: usize) -> FormatError {
    FormatError::Truncated { what, need, have }
}

#[cfg(test)]
#[path = "kv_tests.rs"]
mod tests;
