// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Row tags
//!
//! The two highest bits of a tag encode its type:
//!
//! ```text
//! 00 - invalid
//! 01 - snap
//! 10 - wal
//! 11 - sys (system wal)
//! ```
//!
//! The low 14 bits name what the row carries. Values below 32 are
//! reserved for the system; higher values are user tags handed to the
//! executor untouched.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mask for the kind bits of a tag
pub const TAG_MASK: u16 = 0x3fff;

/// Tag type encoded in the two high bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagType {
    Snap,
    Wal,
    Sys,
}

impl TagType {
    pub const fn bits(self) -> u16 {
        match self {
            TagType::Snap => 0x4000,
            TagType::Wal => 0x8000,
            TagType::Sys => 0xc000,
        }
    }

    fn from_bits(tag: u16) -> Option<Self> {
        match tag & !TAG_MASK {
            0x4000 => Some(TagType::Snap),
            0x8000 => Some(TagType::Wal),
            0xc000 => Some(TagType::Sys),
            _ => None,
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagType::Snap => f.write_str("snap"),
            TagType::Wal => f.write_str("wal"),
            TagType::Sys => f.write_str("sys"),
        }
    }
}

/// What a row carries, from the low 14 bits of its tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    SnapInitial,
    SnapData,
    WalData,
    SnapFinal,
    WalFinal,
    RunCrc,
    Nop,
    RaftAppend,
    RaftCommit,
    RaftVote,
    ShardCreate,
    ShardAlter,
    ShardFinal,
    Tlv,
    PaxosPromise,
    PaxosAccept,
    Sys(u8),
    User(u16),
}

impl TagKind {
    pub fn code(self) -> u16 {
        match self {
            TagKind::SnapInitial => 1,
            TagKind::SnapData => 2,
            TagKind::WalData => 3,
            TagKind::SnapFinal => 4,
            TagKind::WalFinal => 5,
            TagKind::RunCrc => 6,
            TagKind::Nop => 7,
            TagKind::RaftAppend => 8,
            TagKind::RaftCommit => 9,
            TagKind::RaftVote => 10,
            TagKind::ShardCreate => 11,
            TagKind::ShardAlter => 12,
            TagKind::ShardFinal => 13,
            TagKind::Tlv => 14,
            TagKind::PaxosPromise => 15,
            TagKind::PaxosAccept => 16,
            TagKind::Sys(n) => u16::from(n),
            TagKind::User(n) => n & TAG_MASK,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code & TAG_MASK {
            1 => TagKind::SnapInitial,
            2 => TagKind::SnapData,
            3 => TagKind::WalData,
            4 => TagKind::SnapFinal,
            5 => TagKind::WalFinal,
            6 => TagKind::RunCrc,
            7 => TagKind::Nop,
            8 => TagKind::RaftAppend,
            9 => TagKind::RaftCommit,
            10 => TagKind::RaftVote,
            11 => TagKind::ShardCreate,
            12 => TagKind::ShardAlter,
            13 => TagKind::ShardFinal,
            14 => TagKind::Tlv,
            15 => TagKind::PaxosPromise,
            16 => TagKind::PaxosAccept,
            t if t < 32 => TagKind::Sys(t as u8),
            t => TagKind::User(t),
        }
    }

    /// Rows whose payload the executor interprets
    pub fn is_data(self) -> bool {
        matches!(
            self,
            TagKind::SnapData | TagKind::WalData | TagKind::User(_)
        )
    }

    /// Rows a consensus group keeps to rebuild its state
    pub fn is_consensus(self) -> bool {
        matches!(
            self,
            TagKind::RaftAppend
                | TagKind::RaftCommit
                | TagKind::RaftVote
                | TagKind::PaxosPromise
                | TagKind::PaxosAccept
        )
    }

    pub fn is_shard_op(self) -> bool {
        matches!(
            self,
            TagKind::ShardCreate | TagKind::ShardAlter | TagKind::ShardFinal
        )
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKind::SnapInitial => f.write_str("snap_initial"),
            TagKind::SnapData => f.write_str("snap_data"),
            TagKind::WalData => f.write_str("wal_data"),
            TagKind::SnapFinal => f.write_str("snap_final"),
            TagKind::WalFinal => f.write_str("wal_final"),
            TagKind::RunCrc => f.write_str("run_crc"),
            TagKind::Nop => f.write_str("nop"),
            TagKind::RaftAppend => f.write_str("raft_append"),
            TagKind::RaftCommit => f.write_str("raft_commit"),
            TagKind::RaftVote => f.write_str("raft_vote"),
            TagKind::ShardCreate => f.write_str("shard_create"),
            TagKind::ShardAlter => f.write_str("shard_alter"),
            TagKind::ShardFinal => f.write_str("shard_final"),
            TagKind::Tlv => f.write_str("tlv"),
            TagKind::PaxosPromise => f.write_str("paxos_promise"),
            TagKind::PaxosAccept => f.write_str("paxos_accept"),
            TagKind::Sys(n) => write!(f, "sys{}", n),
            TagKind::User(n) => write!(f, "usr{}", n),
        }
    }
}

/// A full 16-bit row tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(u16);

impl Tag {
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn new(tag_type: TagType, kind: TagKind) -> Self {
        Self(tag_type.bits() | kind.code())
    }

    pub fn snap(kind: TagKind) -> Self {
        Self::new(TagType::Snap, kind)
    }

    pub fn wal(kind: TagKind) -> Self {
        Self::new(TagType::Wal, kind)
    }

    pub fn sys(kind: TagKind) -> Self {
        Self::new(TagType::Sys, kind)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn kind(self) -> TagKind {
        TagKind::from_code(self.0)
    }

    /// None when the type bits are `00`, which no valid row carries
    pub fn tag_type(self) -> Option<TagType> {
        TagType::from_bits(self.0)
    }

    /// Fill in the type bits when the caller left them empty
    pub fn with_default_type(self, tag_type: TagType) -> Self {
        if self.0 & !TAG_MASK == 0 {
            Self(self.0 | tag_type.bits())
        } else {
            self
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

#[cfg(test)]
#[path = "tag_tests.rs"]
mod tests;
