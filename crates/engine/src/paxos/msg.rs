// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Paxos peer messages
//!
//! `code:u8` then the fields of the variant, little-endian. Requests and
//! replies share one enum; which side sends what is fixed by the
//! protocol, not the codec.

use crate::peer::{put_bytes, Decided, MsgReader};
use bytes::{BufMut, Bytes, BytesMut};
use tl_core::{FormatError, Scn, Tag};

/// Ballots order proposers: `round << 8 | proposer index`
pub type Ballot = u64;

/// A value an acceptor accepted for one scn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub ballot: Ballot,
    pub tag: Tag,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaxosMsg {
    Prepare {
        scn: Scn,
        ballot: Ballot,
    },
    Promise {
        scn: Scn,
        ballot: Ballot,
        accepted: Option<Accepted>,
    },
    Accept {
        scn: Scn,
        ballot: Ballot,
        tag: Tag,
        value: Bytes,
    },
    Accepted {
        scn: Scn,
        ballot: Ballot,
    },
    /// The acceptor promised a higher ballot
    Nack {
        scn: Scn,
        promised: Ballot,
    },
    /// The scn is already decided; here is the value
    Decided(Decided),
    Commit(Decided),
    /// Reply to a commit with the receiver's applied scn
    Ack {
        scn: Scn,
    },
    Fetch {
        from: Scn,
        max: u32,
    },
    History(Vec<Decided>),
}

const PREPARE: u8 = 1;
const PROMISE: u8 = 2;
const ACCEPT: u8 = 3;
const ACCEPTED: u8 = 4;
const NACK: u8 = 5;
const DECIDED: u8 = 6;
const COMMIT: u8 = 7;
const ACK: u8 = 8;
const FETCH: u8 = 9;
const HISTORY: u8 = 10;

impl PaxosMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            PaxosMsg::Prepare { scn, ballot } => {
                buf.put_u8(PREPARE);
                buf.put_i64_le(*scn);
                buf.put_u64_le(*ballot);
            }
            PaxosMsg::Promise {
                scn,
                ballot,
                accepted,
            } => {
                buf.put_u8(PROMISE);
                buf.put_i64_le(*scn);
                buf.put_u64_le(*ballot);
                match accepted {
                    Some(a) => {
                        buf.put_u8(1);
                        buf.put_u64_le(a.ballot);
                        buf.put_u16_le(a.tag.raw());
                        put_bytes(&mut buf, &a.value);
                    }
                    None => buf.put_u8(0),
                }
            }
            PaxosMsg::Accept {
                scn,
                ballot,
                tag,
                value,
            } => {
                buf.put_u8(ACCEPT);
                buf.put_i64_le(*scn);
                buf.put_u64_le(*ballot);
                buf.put_u16_le(tag.raw());
                put_bytes(&mut buf, value);
            }
            PaxosMsg::Accepted { scn, ballot } => {
                buf.put_u8(ACCEPTED);
                buf.put_i64_le(*scn);
                buf.put_u64_le(*ballot);
            }
            PaxosMsg::Nack { scn, promised } => {
                buf.put_u8(NACK);
                buf.put_i64_le(*scn);
                buf.put_u64_le(*promised);
            }
            PaxosMsg::Decided(d) => {
                buf.put_u8(DECIDED);
                d.encode_into(&mut buf);
            }
            PaxosMsg::Commit(d) => {
                buf.put_u8(COMMIT);
                d.encode_into(&mut buf);
            }
            PaxosMsg::Ack { scn } => {
                buf.put_u8(ACK);
                buf.put_i64_le(*scn);
            }
            PaxosMsg::Fetch { from, max } => {
                buf.put_u8(FETCH);
                buf.put_i64_le(*from);
                buf.put_u32_le(*max);
            }
            PaxosMsg::History(entries) => {
                buf.put_u8(HISTORY);
                buf.put_u32_le(entries.len() as u32);
                for d in entries {
                    d.encode_into(&mut buf);
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: Bytes) -> Result<Self, FormatError> {
        let mut r = MsgReader::new(frame, "paxos message");
        let msg = match r.u8()? {
            PREPARE => PaxosMsg::Prepare {
                scn: r.i64()?,
                ballot: r.u64()?,
            },
            PROMISE => {
                let scn = r.i64()?;
                let ballot = r.u64()?;
                let accepted = match r.u8()? {
                    0 => None,
                    _ => Some(Accepted {
                        ballot: r.u64()?,
                        tag: r.tag()?,
                        value: r.bytes()?,
                    }),
                };
                PaxosMsg::Promise {
                    scn,
                    ballot,
                    accepted,
                }
            }
            ACCEPT => PaxosMsg::Accept {
                scn: r.i64()?,
                ballot: r.u64()?,
                tag: r.tag()?,
                value: r.bytes()?,
            },
            ACCEPTED => PaxosMsg::Accepted {
                scn: r.i64()?,
                ballot: r.u64()?,
            },
            NACK => PaxosMsg::Nack {
                scn: r.i64()?,
                promised: r.u64()?,
            },
            DECIDED => PaxosMsg::Decided(Decided::decode_from(&mut r)?),
            COMMIT => PaxosMsg::Commit(Decided::decode_from(&mut r)?),
            ACK => PaxosMsg::Ack { scn: r.i64()? },
            FETCH => PaxosMsg::Fetch {
                from: r.i64()?,
                max: r.u32()?,
            },
            HISTORY => {
                let count = r.u32()?;
                let mut entries = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    entries.push(Decided::decode_from(&mut r)?);
                }
                PaxosMsg::History(entries)
            }
            code => {
                return Err(FormatError::BadPayload(format!(
                    "unknown paxos message {}",
                    code
                )))
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

/// Payload of a `paxos_promise` row: `ballot:u64`
pub(crate) fn promise_row_data(ballot: Ballot) -> Bytes {
    Bytes::copy_from_slice(&ballot.to_le_bytes())
}

/// Payload of a `paxos_accept` row: `ballot:u64, tag:u16, len:u32, value`
pub(crate) fn accept_row_data(accepted: &Accepted) -> Bytes {
    let mut buf = BytesMut::with_capacity(14 + accepted.value.len());
    buf.put_u64_le(accepted.ballot);
    buf.put_u16_le(accepted.tag.raw());
    put_bytes(&mut buf, &accepted.value);
    buf.freeze()
}

pub(crate) fn decode_promise_row(data: Bytes) -> Result<Ballot, FormatError> {
    let mut r = MsgReader::new(data, "paxos_promise");
    let ballot = r.u64()?;
    r.finish()?;
    Ok(ballot)
}

pub(crate) fn decode_accept_row(data: Bytes) -> Result<Accepted, FormatError> {
    let mut r = MsgReader::new(data, "paxos_accept");
    let accepted = Accepted {
        ballot: r.u64()?,
        tag: r.tag()?,
        value: r.bytes()?,
    };
    r.finish()?;
    Ok(accepted)
}

#[cfg(test)]
#[path = "msg_tests.rs"]
mod tests;
