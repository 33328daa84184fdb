// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tl-core: leaf types for the Tidelog write-ahead log
//!
//! This crate provides:
//! - The binary log row format with header and payload checksums
//! - Row tags and their snap/wal/sys classification
//! - Wire structures for WAL packs and replication handshakes
//! - Shard operation payloads and the rolling run-CRC tracker
//! - A clock abstraction shared by lag and election timing

pub mod clock;
pub mod error;
pub mod kv;
pub mod row;
pub mod run_crc;
pub mod shard_op;
pub mod sys_row;
pub mod tag;
pub mod wire;

/// Log sequence number: physical position within one log file
pub type Lsn = i64;
/// Serial commit number: replica-comparable position within a shard
pub type Scn = i64;
/// Shard identifier as stored in a row header
pub type ShardId = u16;

// Re-exports
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{ErrorClass, FormatError};
pub use kv::KvOp;
pub use row::{Row, RowAux, RowHeader, EOF_MARKER, MAX_ROW_DATA, ROW_HEADER_SIZE, ROW_MARKER};
pub use run_crc::{RunCrc, RunCrcEntry, RunCrcStatus, Verification, RUN_CRC_HISTORY};
pub use shard_op::{ShardOp, ShardType, MAX_PEERS};
pub use sys_row::{RunCrcRecord, SnapInitial};
pub use tag::{Tag, TagKind, TagType};
pub use wire::{FilterSpec, FilterType, Handshake, HandshakeReply, WalReply, WalRequest};
