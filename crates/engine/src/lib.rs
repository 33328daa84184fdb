// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tl-engine: the durability, recovery and replication core
//!
//! A [`Context`] owns every shard and both log directories. Writes go
//! through a shard's consensus group into the [`WalWriter`], whose worker
//! thread makes them durable; confirmed rows are applied before the
//! writer answers. [`Recovery`] rebuilds a context from a snapshot and the
//! WAL, [`replication`] streams rows between nodes, and [`paxos`] and
//! [`raft`] order writes for replicated shards.

mod context;
mod error;
mod executor;
pub mod paxos;
mod peer;
pub mod raft;
mod recovery;
pub mod replication;
mod shard;
mod snapshot;
pub mod wal;

pub use context::{ApplyMode, Context, ContextConfig, SnapshotView};
pub use error::{PaxosError, PullError, RaftError, RecoveryError, ShardError, WalError};
pub use executor::{make_executor, Executor, HashExecutor, TreeExecutor};
pub use paxos::{PaxosConfig, PaxosGroup};
pub use peer::{Decided, PeerRouter};
pub use raft::{RaftConfig, RaftGroup, Role};
pub use recovery::{Recovery, RecoveryState, ReplayReport, TailTruncation};
pub use shard::{Applied, PrimaryConsensus, Shard, ShardConsensus, ShardImage, ShardStatus};
pub use snapshot::{read_snapshot, write_snapshot, SnapshotSummary};
pub use wal::{ConfirmSink, Fault, Pack, WalTicket, WalWriter, WalWriterConfig};
