// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plumbing shared by the quorum consensus groups
//!
//! Every peer frame starts with the shard id, so one listener serves all
//! groups of a node. Decided values are applied through [`Committer`],
//! which keeps a shard's scn contiguous even when decisions arrive out of
//! order, and served to lagging peers from the local WAL.

use crate::error::ShardError;
use crate::shard::Shard;
use crate::wal::WalWriter;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tl_adapters::FrameHandler;
use tl_core::{Clock, FormatError, Row, Scn, ShardId, Tag};
use tl_storage::{FileKind, LogDir, LogError, LogFile, XlogReader};

/// Routes peer frames to the group owning their shard
#[derive(Default)]
pub struct PeerRouter {
    groups: RwLock<BTreeMap<ShardId, Arc<dyn FrameHandler>>>,
}

impl PeerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, shard: ShardId, group: Arc<dyn FrameHandler>) {
        self.groups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(shard, group);
    }

    pub fn remove(&self, shard: ShardId) {
        self.groups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&shard);
    }
}

#[async_trait]
impl FrameHandler for PeerRouter {
    async fn handle(&self, mut frame: Bytes) -> Result<Bytes, String> {
        if frame.len() < 2 {
            return Err("frame too short".to_string());
        }
        let shard = frame.get_u16_le();
        let group = self
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&shard)
            .cloned();
        match group {
            Some(group) => group.handle(frame).await,
            None => Err(format!("no consensus group for shard {}", shard)),
        }
    }
}

/// Prefix a group message with its shard id
pub(crate) fn address(shard: ShardId, msg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + msg.len());
    buf.put_u16_le(shard);
    buf.put_slice(msg);
    buf.freeze()
}

/// Votes needed out of `members`
pub(crate) fn majority(members: usize) -> usize {
    members / 2 + 1
}

/// Bounds-checked reads for peer message decoding
pub(crate) struct MsgReader {
    buf: Bytes,
    what: &'static str,
}

impl MsgReader {
    pub(crate) fn new(buf: Bytes, what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> Result<(), FormatError> {
        if self.buf.remaining() < n {
            return Err(FormatError::Truncated {
                what: self.what,
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, FormatError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, FormatError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, FormatError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn i64(&mut self) -> Result<i64, FormatError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub(crate) fn tag(&mut self) -> Result<Tag, FormatError> {
        self.need(2)?;
        Ok(Tag::from_raw(self.buf.get_u16_le()))
    }

    /// `len:u32` then bytes
    pub(crate) fn bytes(&mut self) -> Result<Bytes, FormatError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub(crate) fn string(&mut self) -> Result<String, FormatError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| FormatError::BadPayload(format!("{}: name is not utf-8", self.what)))
    }

    pub(crate) fn finish(self) -> Result<(), FormatError> {
        if self.buf.has_remaining() {
            return Err(FormatError::BadPayload(format!(
                "{}: {} trailing bytes",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

pub(crate) fn put_bytes(buf: &mut BytesMut, raw: &[u8]) {
    buf.put_u32_le(raw.len() as u32);
    buf.put_slice(raw);
}

/// One decided value as stored in the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decided {
    pub scn: Scn,
    pub tag: Tag,
    pub value: Bytes,
}

impl Decided {
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.scn);
        buf.put_u16_le(self.tag.raw());
        put_bytes(buf, &self.value);
    }

    pub(crate) fn decode_from(reader: &mut MsgReader) -> Result<Self, FormatError> {
        Ok(Self {
            scn: reader.i64()?,
            tag: reader.tag()?,
            value: reader.bytes()?,
        })
    }
}

/// Applies decided values to a shard in scn order
pub(crate) struct Committer<C: Clock> {
    shard: Arc<Shard>,
    wal: WalWriter,
    clock: C,
    /// Decisions past a gap, waiting for the values before them
    waiting: tokio::sync::Mutex<BTreeMap<Scn, Decided>>,
}

impl<C: Clock> Committer<C> {
    pub(crate) fn new(shard: Arc<Shard>, wal: WalWriter, clock: C) -> Self {
        Self {
            shard,
            wal,
            clock,
            waiting: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    pub(crate) fn wal(&self) -> &WalWriter {
        &self.wal
    }

    pub(crate) fn clock(&self) -> &C {
        &self.clock
    }

    /// Record a decision and apply every contiguous one after the
    /// shard's scn; returns true while a gap remains
    pub(crate) async fn commit(&self, decided: Decided) -> Result<bool, ShardError> {
        let mut waiting = self.waiting.lock().await;
        if decided.scn > self.shard.scn() {
            waiting.insert(decided.scn, decided);
        }
        loop {
            let next = self.shard.scn() + 1;
            waiting.retain(|scn, _| *scn >= next);
            let Some(decided) = waiting.remove(&next) else {
                break;
            };
            let row = Row::new(decided.tag, self.shard.id(), decided.scn, decided.value)
                .with_tm(self.clock.wall());
            let permit = self.wal.reserve().await?;
            let ticket = self.shard.enqueue_row(&self.wal, permit, row)?;
            ticket.wait().await?;
        }
        Ok(!waiting.is_empty())
    }
}

/// Read up to `max` decided values of `shard` from `from` on
///
/// Starts at the newest file opened after the shard passed at most
/// `from - 1`, so older files are never opened. Stops quietly at a torn
/// tail or a hole in the history.
pub(crate) fn read_history(
    dir: &LogDir,
    shard: ShardId,
    from: Scn,
    max: usize,
) -> Result<Vec<Decided>, LogError> {
    let files = dir.files()?;
    let start = history_start(dir, &files, shard, from - 1)?;
    scan_history(&files[start..], shard, from, max)
}

/// Index of the newest file whose `SCN-<shard>` marker is at most `scn`
///
/// A marker is the shard's highest scn when the file was opened, so no
/// earlier file holds a row past `scn`. Without one the scan starts at
/// the first file.
fn history_start(dir: &LogDir, files: &[LogFile], shard: ShardId, scn: Scn) -> Result<usize, LogError> {
    for (i, file) in files.iter().enumerate().rev() {
        if let Some(&marker) = dir.read_header(&file.path)?.scns.get(&shard) {
            if marker <= scn {
                return Ok(i);
            }
        }
    }
    Ok(0)
}

fn scan_history(
    files: &[LogFile],
    shard: ShardId,
    from: Scn,
    max: usize,
) -> Result<Vec<Decided>, LogError> {
    let mut out = Vec::new();
    for file in files {
        let reader = XlogReader::open(&file.path, FileKind::Xlog)?;
        for row in reader.rows()? {
            let Ok(row) = row else {
                break;
            };
            if row.shard_id != shard || !row.tag.kind().is_data() {
                continue;
            }
            let expected = from + out.len() as Scn;
            if row.scn < expected {
                continue;
            }
            if row.scn > expected {
                return Ok(out);
            }
            out.push(Decided {
                scn: row.scn,
                tag: row.tag,
                value: row.data,
            });
            if out.len() >= max {
                return Ok(out);
            }
        }
    }
    Ok(out)
}

/// [`read_history`] off the async runtime
pub(crate) async fn load_history(
    dir: LogDir,
    shard: ShardId,
    from: Scn,
    max: usize,
) -> Result<Vec<Decided>, LogError> {
    tokio::task::spawn_blocking(move || read_history(&dir, shard, from, max))
        .await
        .map_err(|e| LogError::Io(std::io::Error::other(e.to_string())))?
}

#[cfg(test)]
#[path = "peer_tests.rs"]
mod tests;
