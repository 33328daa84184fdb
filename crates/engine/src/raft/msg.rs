// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Raft peer messages, encoded like the Paxos ones

use crate::peer::{put_bytes, Decided, MsgReader};
use bytes::{BufMut, Bytes, BytesMut};
use tl_core::{FormatError, Scn, Tag};

pub type Term = u64;

/// One log entry; its index doubles as the shard scn once committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: Scn,
    pub term: Term,
    pub tag: Tag,
    pub value: Bytes,
}

impl Entry {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.index);
        buf.put_u64_le(self.term);
        buf.put_u16_le(self.tag.raw());
        put_bytes(buf, &self.value);
    }

    fn decode_from(r: &mut MsgReader) -> Result<Self, FormatError> {
        Ok(Self {
            index: r.i64()?,
            term: r.u64()?,
            tag: r.tag()?,
            value: r.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftMsg {
    RequestVote {
        term: Term,
        candidate: String,
        last_index: Scn,
        last_term: Term,
    },
    Vote {
        term: Term,
        granted: bool,
    },
    AppendEntries {
        term: Term,
        leader: String,
        prev_index: Scn,
        prev_term: Term,
        /// Oldest entry the leader still holds in memory
        first_index: Scn,
        commit: Scn,
        entries: Vec<Entry>,
    },
    Appended {
        term: Term,
        success: bool,
        /// Follower's last log index
        last_index: Scn,
    },
    /// Committed entries older than the leader's in-memory log
    PullEntries {
        from: Scn,
        max: u32,
    },
    Entries {
        entries: Vec<Decided>,
        /// Term of the last entry, when the leader still knows it
        last_term: Term,
    },
}

const REQUEST_VOTE: u8 = 1;
const VOTE: u8 = 2;
const APPEND_ENTRIES: u8 = 3;
const APPENDED: u8 = 4;
const PULL_ENTRIES: u8 = 5;
const ENTRIES: u8 = 6;

impl RaftMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(48);
        match self {
            RaftMsg::RequestVote {
                term,
                candidate,
                last_index,
                last_term,
            } => {
                buf.put_u8(REQUEST_VOTE);
                buf.put_u64_le(*term);
                put_bytes(&mut buf, candidate.as_bytes());
                buf.put_i64_le(*last_index);
                buf.put_u64_le(*last_term);
            }
            RaftMsg::Vote { term, granted } => {
                buf.put_u8(VOTE);
                buf.put_u64_le(*term);
                buf.put_u8(u8::from(*granted));
            }
            RaftMsg::AppendEntries {
                term,
                leader,
                prev_index,
                prev_term,
                first_index,
                commit,
                entries,
            } => {
                buf.put_u8(APPEND_ENTRIES);
                buf.put_u64_le(*term);
                put_bytes(&mut buf, leader.as_bytes());
                buf.put_i64_le(*prev_index);
                buf.put_u64_le(*prev_term);
                buf.put_i64_le(*first_index);
                buf.put_i64_le(*commit);
                buf.put_u32_le(entries.len() as u32);
                for entry in entries {
                    entry.encode_into(&mut buf);
                }
            }
            RaftMsg::Appended {
                term,
                success,
                last_index,
            } => {
                buf.put_u8(APPENDED);
                buf.put_u64_le(*term);
                buf.put_u8(u8::from(*success));
                buf.put_i64_le(*last_index);
            }
            RaftMsg::PullEntries { from, max } => {
                buf.put_u8(PULL_ENTRIES);
                buf.put_i64_le(*from);
                buf.put_u32_le(*max);
            }
            RaftMsg::Entries { entries, last_term } => {
                buf.put_u8(ENTRIES);
                buf.put_u64_le(*last_term);
                buf.put_u32_le(entries.len() as u32);
                for d in entries {
                    d.encode_into(&mut buf);
                }
            }
        }
        buf.freeze()
    }

    pub fn decode(frame: Bytes) -> Result<Self, FormatError> {
        let mut r = MsgReader::new(frame, "raft message");
        let msg = match r.u8()? {
            REQUEST_VOTE => RaftMsg::RequestVote {
                term: r.u64()?,
                candidate: r.string()?,
                last_index: r.i64()?,
                last_term: r.u64()?,
            },
            VOTE => RaftMsg::Vote {
                term: r.u64()?,
                granted: r.u8()? != 0,
            },
            APPEND_ENTRIES => {
                let term = r.u64()?;
                let leader = r.string()?;
                let prev_index = r.i64()?;
                let prev_term = r.u64()?;
                let first_index = r.i64()?;
                let commit = r.i64()?;
                let count = r.u32()?;
                let mut entries = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    entries.push(Entry::decode_from(&mut r)?);
                }
                RaftMsg::AppendEntries {
                    term,
                    leader,
                    prev_index,
                    prev_term,
                    first_index,
                    commit,
                    entries,
                }
            }
            APPENDED => RaftMsg::Appended {
                term: r.u64()?,
                success: r.u8()? != 0,
                last_index: r.i64()?,
            },
            PULL_ENTRIES => RaftMsg::PullEntries {
                from: r.i64()?,
                max: r.u32()?,
            },
            ENTRIES => {
                let last_term = r.u64()?;
                let count = r.u32()?;
                let mut entries = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    entries.push(Decided::decode_from(&mut r)?);
                }
                RaftMsg::Entries { entries, last_term }
            }
            code => {
                return Err(FormatError::BadPayload(format!(
                    "unknown raft message {}",
                    code
                )))
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

/// `raft_append` row payload: the entry minus its index, which is the
/// row's scn
pub(crate) fn append_row_data(entry: &Entry) -> Bytes {
    let mut buf = BytesMut::with_capacity(14 + entry.value.len());
    buf.put_u64_le(entry.term);
    buf.put_u16_le(entry.tag.raw());
    put_bytes(&mut buf, &entry.value);
    buf.freeze()
}

pub(crate) fn decode_append_row(index: Scn, data: Bytes) -> Result<Entry, FormatError> {
    let mut r = MsgReader::new(data, "raft_append");
    let entry = Entry {
        index,
        term: r.u64()?,
        tag: r.tag()?,
        value: r.bytes()?,
    };
    r.finish()?;
    Ok(entry)
}

/// `raft_vote` row payload: `term:u64, len:u32, voted_for`
pub(crate) fn vote_row_data(term: Term, voted_for: Option<&str>) -> Bytes {
    let name = voted_for.unwrap_or("");
    let mut buf = BytesMut::with_capacity(12 + name.len());
    buf.put_u64_le(term);
    put_bytes(&mut buf, name.as_bytes());
    buf.freeze()
}

pub(crate) fn decode_vote_row(data: Bytes) -> Result<(Term, Option<String>), FormatError> {
    let mut r = MsgReader::new(data, "raft_vote");
    let term = r.u64()?;
    let name = r.string()?;
    r.finish()?;
    Ok((term, (!name.is_empty()).then_some(name)))
}

/// `raft_commit` row payload: `term:u64` of the applied entry at the row's scn
///
/// Marks the term of an entry no longer held as a `raft_append` row.
pub(crate) fn commit_row_data(term: Term) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64_le(term);
    buf.freeze()
}

pub(crate) fn decode_commit_row(data: Bytes) -> Result<Term, FormatError> {
    let mut r = MsgReader::new(data, "raft_commit");
    let term = r.u64()?;
    r.finish()?;
    Ok(term)
}

#[cfg(test)]
#[path = "msg_tests.rs"]
mod tests;
