// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary structures exchanged between processes and threads
//!
//! - [`WalRequest`] / [`WalReply`]: engine to durability worker
//! - [`Handshake`] / [`HandshakeReply`]: replication puller to feeder

mod handshake;
mod pack;

pub use handshake::{
    FilterSpec, FilterType, Handshake, HandshakeReply, FILTER_NAME_LEN, HANDSHAKE_V1_LEN,
};
pub use pack::{
    WalReply, WalRequest, WAL_REPLY_HEADER_LEN, WAL_REQUEST_HEADER_LEN, WAL_REQUEST_MAGIC,
};

use crate::error::FormatError;

fn need(what: &'static str, need: usize, have: usize) -> Result<(), FormatError> {
    if have < need {
        Err(FormatError::Truncated { what, need, have })
    } else {
        Ok(())
    }
}
