// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replication handshake
//!
//! ```text
//! v1:    version:u32 scn:i64 filter_name:[u8;32]
//! v2:    v1 + filter_type:u32 filter_arg_len:u32 filter_arg
//! reply: version:u32 msg_len:u32 msg          (version 0 = rejected)
//! ```

use super::need;
use crate::error::FormatError;
use crate::Scn;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const FILTER_NAME_LEN: usize = 32;
pub const HANDSHAKE_V1_LEN: usize = 4 + 8 + FILTER_NAME_LEN;
const V2_EXTRA_LEN: usize = 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// Pass rows through unchanged
    Id,
    /// Filter defined by a named script
    Script,
    /// Filter compiled into the feeder
    Native,
}

impl FilterType {
    fn code(self) -> u32 {
        match self {
            FilterType::Id => 0,
            FilterType::Script => 1,
            FilterType::Native => 2,
        }
    }

    fn from_code(code: u32) -> Result<Self, FormatError> {
        match code {
            0 => Ok(FilterType::Id),
            1 => Ok(FilterType::Script),
            2 => Ok(FilterType::Native),
            other => Err(FormatError::BadPayload(format!(
                "unknown filter type {}",
                other
            ))),
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterType::Id => f.write_str("id"),
            FilterType::Script => f.write_str("script"),
            FilterType::Native => f.write_str("native"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FilterType,
    #[serde(default, with = "arg_bytes")]
    pub arg: Bytes,
}

impl FilterSpec {
    pub fn native(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FilterType::Native,
            arg: Bytes::new(),
        }
    }
}

mod arg_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(arg: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(arg))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Bytes::from(raw.into_bytes()))
    }
}

/// First message on a replication connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    /// Stream rows with an scn greater than this
    pub scn: Scn,
    pub filter: Option<FilterSpec>,
}

impl Handshake {
    pub const V1: u32 = 1;
    pub const V2: u32 = 2;

    pub fn new(scn: Scn, filter: Option<FilterSpec>) -> Self {
        Self {
            version: Self::V2,
            scn,
            filter,
        }
    }

    pub fn encode(&self) -> Result<Bytes, FormatError> {
        let (name, kind, arg) = match &self.filter {
            Some(f) => (f.name.as_str(), f.kind, f.arg.clone()),
            None => ("", FilterType::Id, Bytes::new()),
        };
        if name.len() >= FILTER_NAME_LEN {
            return Err(FormatError::BadPayload(format!(
                "filter name {:?} too long",
                name
            )));
        }
        if self.version == Self::V1 && (kind != FilterType::Id && kind != FilterType::Script) {
            return Err(FormatError::BadPayload(
                "v1 handshake carries only script filters".to_string(),
            ));
        }

        let mut buf = BytesMut::with_capacity(HANDSHAKE_V1_LEN + V2_EXTRA_LEN + arg.len());
        buf.put_u32_le(self.version);
        buf.put_i64_le(self.scn);
        let mut field = [0u8; FILTER_NAME_LEN];
        field[..name.len()].copy_from_slice(name.as_bytes());
        buf.put_slice(&field);
        if self.version >= Self::V2 {
            buf.put_u32_le(kind.code());
            buf.put_u32_le(arg.len() as u32);
            buf.put_slice(&arg);
        }
        Ok(buf.freeze())
    }

    /// Bytes still needed after the fixed v1 prefix
    ///
    /// For v2 this needs the first `HANDSHAKE_V1_LEN + 8` bytes to read the
    /// argument length; callers reading from a stream call it twice.
    pub fn remaining_len(prefix: &[u8]) -> Result<usize, FormatError> {
        need("handshake", 4, prefix.len())?;
        let version = (&prefix[..4]).get_u32_le();
        if version < Self::V2 {
            return Ok(HANDSHAKE_V1_LEN.saturating_sub(prefix.len()));
        }
        let fixed = HANDSHAKE_V1_LEN + V2_EXTRA_LEN;
        if prefix.len() < fixed {
            return Ok(fixed - prefix.len());
        }
        let arg_len = (&prefix[HANDSHAKE_V1_LEN + 4..fixed]).get_u32_le() as usize;
        Ok((fixed + arg_len).saturating_sub(prefix.len()))
    }

    /// Decode; versions above the known set are returned as-is so the
    /// feeder can reject them with a reply instead of a parse error
    pub fn decode(input: &[u8]) -> Result<Self, FormatError> {
        need("handshake", HANDSHAKE_V1_LEN, input.len())?;
        let mut buf = input;
        let version = buf.get_u32_le();
        let scn = buf.get_i64_le();
        let mut field = [0u8; FILTER_NAME_LEN];
        buf.copy_to_slice(&mut field);
        let end = field.iter().position(|&b| b == 0).unwrap_or(FILTER_NAME_LEN);
        let name = String::from_utf8(field[..end].to_vec())
            .map_err(|_| FormatError::BadPayload("filter name is not utf-8".to_string()))?;

        let (kind, arg) = if version >= Self::V2 {
            need("handshake filter", V2_EXTRA_LEN, buf.remaining())?;
            let kind = FilterType::from_code(buf.get_u32_le())?;
            let arg_len = buf.get_u32_le() as usize;
            need("handshake filter arg", arg_len, buf.remaining())?;
            (kind, Bytes::copy_from_slice(&buf[..arg_len]))
        } else if name.is_empty() {
            (FilterType::Id, Bytes::new())
        } else {
            (FilterType::Script, Bytes::new())
        };

        // an unnamed id filter without an argument is how `None` is sent
        let filter = if name.is_empty() && kind == FilterType::Id && arg.is_empty() {
            None
        } else {
            Some(FilterSpec { name, kind, arg })
        };
        Ok(Self {
            version,
            scn,
            filter,
        })
    }
}

/// Feeder's answer to a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    /// Accepted protocol version; zero rejects the handshake
    pub version: u32,
    pub message: String,
}

impl HandshakeReply {
    pub const HEADER_LEN: usize = 8;

    pub fn accept(version: u32) -> Self {
        Self {
            version,
            message: String::new(),
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            version: 0,
            message: message.into(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.version == 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.message.len());
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.message.len() as u32);
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    /// Message length announced by a reply header
    pub fn message_len(header: &[u8]) -> Result<usize, FormatError> {
        need("handshake reply", Self::HEADER_LEN, header.len())?;
        Ok((&header[4..8]).get_u32_le() as usize)
    }

    pub fn decode(input: &[u8]) -> Result<Self, FormatError> {
        let len = Self::message_len(input)?;
        need("handshake reply", Self::HEADER_LEN + len, input.len())?;
        let version = (&input[..4]).get_u32_le();
        let message = String::from_utf8_lossy(&input[Self::HEADER_LEN..Self::HEADER_LEN + len])
            .into_owned();
        Ok(Self { version, message })
    }
}

#[cfg(test)]
#[path = "handshake_tests.rs"]
mod tests;
