// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the engine
//!
//! Every error maps onto an [`ErrorClass`] so shard status can report the
//! last failure without exposing internal types.

use std::path::PathBuf;
use thiserror::Error;
use tl_adapters::TransportError;
use tl_core::{ErrorClass, FormatError, Lsn, Scn, ShardId};
use tl_storage::LogError;

/// Errors from the WAL writer pipeline
#[derive(Debug, Clone, Error)]
pub enum WalError {
    #[error("wal writer is shut down")]
    Shutdown,
    #[error("pack is full ({0} rows)")]
    PackFull(usize),
    #[error("wal worker failed: {0}")]
    Worker(String),
    #[error("pack {seq} only partially written ({written} of {expected} rows)")]
    WriteFailed {
        seq: i64,
        written: u32,
        expected: usize,
    },
    #[error("confirmed rows could not be applied: {0}")]
    Apply(String),
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl WalError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WalError::Apply(_) | WalError::Format(_) => ErrorClass::Format,
            _ => ErrorClass::TransientIo,
        }
    }
}

/// Errors from executors and shard bookkeeping
#[derive(Debug, Clone, Error)]
pub enum ShardError {
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),
    #[error("shard {0} already exists")]
    ShardExists(ShardId),
    #[error("unknown executor module {0:?}")]
    UnknownModule(String),
    #[error("shard {shard}: scn gap, expected {expected}, got {got}")]
    ScnGap {
        shard: ShardId,
        expected: Scn,
        got: Scn,
    },
    #[error("shard {0} is final")]
    Final(ShardId),
    #[error("shard {0} is a replica; writes come from its source")]
    Replica(ShardId),
    #[error("shard {0} has no consensus attached")]
    Detached(ShardId),
    #[error("shard {shard}: not the leader (leader: {leader:?})")]
    NotLeader {
        shard: ShardId,
        leader: Option<String>,
    },
    #[error("invalid payload: {0}")]
    Payload(#[from] FormatError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("consensus: {0}")]
    Consensus(String),
    #[error("storage: {0}")]
    Storage(String),
}

impl ShardError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ShardError::Payload(_) | ShardError::ScnGap { .. } => ErrorClass::Format,
            ShardError::Wal(e) => e.class(),
            ShardError::NotLeader { .. } => ErrorClass::ConsensusConflict,
            ShardError::Consensus(_) | ShardError::Storage(_) => ErrorClass::TransientIo,
            _ => ErrorClass::Protocol,
        }
    }
}

/// Errors from snapshot loading, WAL replay and state transitions
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("{path} is corrupt at offset {offset}: {source}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        #[source]
        source: FormatError,
    },
    #[error("snapshot {0} is missing snap_final")]
    SnapshotIncomplete(PathBuf),
    #[error("snapshot {path}: {reason}")]
    SnapshotInvalid { path: PathBuf, reason: String },
    #[error("no snapshot at lsn {0}")]
    SnapshotMissing(Lsn),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("invalid transition from {from} to {to}")]
    InvalidState {
        from: &'static str,
        to: &'static str,
    },
    #[error("snapshot task failed: {0}")]
    Join(String),
}

impl RecoveryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RecoveryError::Log(e) => e.class(),
            RecoveryError::Shard(e) => e.class(),
            RecoveryError::Wal(e) => e.class(),
            RecoveryError::Join(_) => ErrorClass::TransientIo,
            RecoveryError::InvalidState { .. } => ErrorClass::Protocol,
            _ => ErrorClass::Format,
        }
    }
}

/// Errors from the replication puller and feeder
#[derive(Debug, Error)]
pub enum PullError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream corrupt: {0}")]
    Format(#[from] FormatError),
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("receive aborted")]
    Aborted,
    #[error("connection closed by feeder")]
    Closed,
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("received row not applied: {0}")]
    Apply(#[from] ShardError),
}

impl PullError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PullError::Format(_) => ErrorClass::Format,
            PullError::Rejected(_) | PullError::Protocol(_) => ErrorClass::Protocol,
            PullError::Log(e) => e.class(),
            PullError::Apply(e) => e.class(),
            _ => ErrorClass::TransientIo,
        }
    }

    /// Version or filter mismatches are never retried
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Protocol
    }
}

/// Errors from Paxos rounds
#[derive(Debug, Error)]
pub enum PaxosError {
    #[error("no quorum for scn {scn} after {attempts} attempts")]
    NoQuorum { scn: Scn, attempts: u32 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("bad message: {0}")]
    Decode(#[from] FormatError),
    #[error(transparent)]
    Log(#[from] LogError),
}

impl PaxosError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PaxosError::NoQuorum { .. } => ErrorClass::TransientIo,
            PaxosError::Transport(e) => e.class(),
            PaxosError::Shard(e) => e.class(),
            PaxosError::Wal(e) => e.class(),
            PaxosError::Decode(_) => ErrorClass::Protocol,
            PaxosError::Log(e) => e.class(),
        }
    }
}

/// Errors from Raft replication
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader { leader: Option<String> },
    #[error("no quorum for index {0}")]
    NoQuorum(Scn),
    #[error("leadership lost while replicating index {0}")]
    Deposed(Scn),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("bad message: {0}")]
    Decode(#[from] FormatError),
    #[error(transparent)]
    Log(#[from] LogError),
}

impl RaftError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RaftError::NotLeader { .. } | RaftError::Deposed(_) => ErrorClass::ConsensusConflict,
            RaftError::NoQuorum(_) => ErrorClass::TransientIo,
            RaftError::Transport(e) => e.class(),
            RaftError::Shard(e) => e.class(),
            RaftError::Wal(e) => e.class(),
            RaftError::Decode(_) => ErrorClass::Protocol,
            RaftError::Log(e) => e.class(),
        }
    }
}
