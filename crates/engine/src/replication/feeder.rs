// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server side of the replication stream
//!
//! The feeder answers a handshake, picks the first WAL file that can hold
//! rows past the requested scn, and streams matching rows. It follows the
//! in-progress tail and moves to the next file once a file is sealed.

use super::{frame_row, ping, SHARD_FILTER};
use crate::error::PullError;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tl_core::{
    Clock, FilterSpec, FilterType, FormatError, Handshake, HandshakeReply, Lsn, Row, Scn,
    ShardId, SystemClock, TagKind,
};
use tl_storage::{FileKind, LogDir, LogError, ReadEnd, XlogReader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// Longest handshake accepted, filter argument included
const MAX_HANDSHAKE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FeederConfig {
    /// How often an idle feeder looks for new rows
    pub poll_interval: Duration,
    /// Idle time before a ping row is sent
    pub ping_interval: Duration,
    /// Rows read from disk per step
    pub batch_rows: usize,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            ping_interval: Duration::from_secs(1),
            batch_rows: 512,
        }
    }
}

/// Filter resolved from a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    All,
    Shards(BTreeSet<ShardId>),
}

impl RowFilter {
    /// Resolve a requested filter; the error is sent back as the rejection
    pub fn from_spec(spec: Option<&FilterSpec>) -> Result<Self, String> {
        let Some(spec) = spec else {
            return Ok(RowFilter::All);
        };
        match (spec.kind, spec.name.as_str()) {
            (FilterType::Id, _) => Ok(RowFilter::All),
            (FilterType::Script, name) => Err(format!("script filter {:?} is not available", name)),
            (FilterType::Native, SHARD_FILTER) => {
                if spec.arg.is_empty() || spec.arg.len() % 2 != 0 {
                    return Err("shard filter needs a list of u16 shard ids".to_string());
                }
                Ok(RowFilter::Shards(
                    spec.arg
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                ))
            }
            (FilterType::Native, name) => Err(format!("unknown native filter {:?}", name)),
        }
    }

    /// Handshake filter selecting `shards`
    pub fn shard_spec(shards: &[ShardId]) -> FilterSpec {
        let arg: Vec<u8> = shards.iter().flat_map(|id| id.to_le_bytes()).collect();
        FilterSpec {
            arg: Bytes::from(arg),
            ..FilterSpec::native(SHARD_FILTER)
        }
    }

    pub fn accepts(&self, row: &Row) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Shards(ids) => ids.contains(&row.shard_id),
        }
    }
}

/// Rows a replica starting after `scn` needs
fn wanted(row: &Row, scn: Scn) -> bool {
    let kind = row.tag.kind();
    if kind.is_data() {
        return row.scn > scn;
    }
    match kind {
        TagKind::WalFinal
        | TagKind::PaxosPromise
        | TagKind::PaxosAccept
        | TagKind::RaftAppend
        | TagKind::RaftCommit
        | TagKind::RaftVote => false,
        _ => row.scn >= scn,
    }
}

/// Read position: file identified by first lsn, and a row boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    file: Lsn,
    offset: u64,
}

struct Batch {
    rows: Vec<Row>,
    cursor: Option<Cursor>,
}

pub struct Feeder<C: Clock = SystemClock> {
    dir: LogDir,
    config: FeederConfig,
    clock: C,
}

impl<C: Clock> Feeder<C> {
    pub fn new(dir: LogDir, config: FeederConfig, clock: C) -> Self {
        Self { dir, config, clock }
    }

    /// Serve one replica until it disconnects; returns rows sent
    pub async fn feed<S>(&self, mut stream: S) -> Result<u64, PullError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let handshake = read_handshake(&mut stream).await?;
        if handshake.version == 0 || handshake.version > Handshake::V2 {
            let msg = format!("unsupported version {}", handshake.version);
            return reject(&mut stream, msg).await;
        }
        let filter = match RowFilter::from_spec(handshake.filter.as_ref()) {
            Ok(filter) => filter,
            Err(msg) => return reject(&mut stream, msg).await,
        };
        stream.write_all(&HandshakeReply::accept(handshake.version).encode()).await?;
        stream.flush().await?;
        tracing::info!(scn = handshake.scn, ?filter, "feeding replica");

        let mut cursor = self.start(&filter, handshake.scn)?;
        let mut sent = 0u64;
        let mut last_sent = Instant::now();
        let mut buf = BytesMut::new();
        loop {
            let batch = self.read_batch(cursor).await?;
            let moved = batch.cursor != cursor;
            cursor = batch.cursor;
            for row in batch.rows.iter().filter(|r| filter.accepts(r) && wanted(r, handshake.scn)) {
                frame_row(&mut buf, row)?;
                sent += 1;
            }
            if !buf.is_empty() {
                stream.write_all(&buf).await?;
                stream.flush().await?;
                buf.clear();
                last_sent = Instant::now();
            } else if last_sent.elapsed() >= self.config.ping_interval {
                frame_row(&mut buf, &ping(self.clock.wall()))?;
                stream.write_all(&buf).await?;
                stream.flush().await?;
                buf.clear();
                last_sent = Instant::now();
            }
            if batch.rows.is_empty() && !moved {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// First file to read: the one holding `scn` for a single filtered
    /// shard, otherwise the oldest
    fn start(&self, filter: &RowFilter, scn: Scn) -> Result<Option<Cursor>, LogError> {
        let mut first = None;
        if let (RowFilter::Shards(ids), true) = (filter, scn > 0) {
            for id in ids {
                if let Some(file) = self.dir.find_by_scn(*id, scn)? {
                    first = Some(first.map_or(file.lsn, |lsn: Lsn| lsn.min(file.lsn)));
                }
            }
        }
        if first.is_none() {
            first = self.dir.files()?.first().map(|f| f.lsn);
        }
        Ok(first.map(|file| Cursor { file, offset: 0 }))
    }

    async fn read_batch(&self, cursor: Option<Cursor>) -> Result<Batch, PullError> {
        let dir = self.dir.clone();
        let max = self.config.batch_rows.max(1);
        tokio::task::spawn_blocking(move || read_batch(&dir, cursor, max))
            .await
            .map_err(|e| PullError::Protocol(format!("reader task failed: {}", e)))?
    }
}

fn read_batch(dir: &LogDir, cursor: Option<Cursor>, max: usize) -> Result<Batch, PullError> {
    let files = dir.files()?;
    let cursor = match cursor {
        Some(c) => c,
        None => match files.first() {
            Some(f) => Cursor { file: f.lsn, offset: 0 },
            None => {
                return Ok(Batch {
                    rows: Vec::new(),
                    cursor: None,
                })
            }
        },
    };
    let Some(index) = files.iter().position(|f| f.lsn == cursor.file) else {
        return Err(PullError::Protocol(format!("wal file {} disappeared", cursor.file)));
    };
    let file = &files[index];
    let reader = XlogReader::open(&file.path, FileKind::Xlog)?;
    let mut iter = reader.rows_from(cursor.offset)?;
    let mut rows = Vec::new();
    let mut failure = None;
    for row in iter.by_ref() {
        match row {
            Ok(row) => {
                rows.push(row);
                if rows.len() >= max {
                    break;
                }
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let mut next = Cursor {
        file: cursor.file,
        offset: iter.last_valid_position(),
    };
    match iter.end() {
        ReadEnd::Sealed => {
            if let Some(following) = files.get(index + 1) {
                next = Cursor {
                    file: following.lsn,
                    offset: 0,
                };
            }
        }
        ReadEnd::Broken { offset, error } => {
            let is_tail = file.in_progress || index + 1 == files.len();
            if !is_tail || !error.is_truncation() {
                return Err(PullError::Format(corrupt(&file.path, *offset, error)));
            }
        }
        ReadEnd::Pending | ReadEnd::Open => {
            if let Some(e) = failure {
                return Err(e.into());
            }
        }
    }
    Ok(Batch {
        rows,
        cursor: Some(next),
    })
}

fn corrupt(path: &std::path::Path, offset: u64, error: &FormatError) -> FormatError {
    tracing::error!(path = %path.display(), offset, %error, "corrupt row in served wal");
    error.clone()
}

async fn read_handshake<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Handshake, PullError> {
    let mut raw = vec![0u8; 4];
    stream.read_exact(&mut raw).await?;
    loop {
        let more = Handshake::remaining_len(&raw)?;
        if more == 0 {
            break;
        }
        if raw.len() + more > MAX_HANDSHAKE {
            return Err(PullError::Protocol("handshake too long".to_string()));
        }
        let start = raw.len();
        raw.resize(start + more, 0);
        stream.read_exact(&mut raw[start..]).await?;
    }
    Ok(Handshake::decode(&raw)?)
}

async fn reject<S, T>(stream: &mut S, msg: String) -> Result<T, PullError>
where
    S: AsyncWrite + Unpin,
{
    tracing::warn!(reason = %msg, "rejecting replica");
    stream.write_all(&HandshakeReply::reject(msg.clone()).encode()).await?;
    stream.flush().await?;
    Err(PullError::Protocol(msg))
}

/// Accept replicas and feed each on its own task
pub async fn serve_feeder<C: Clock>(listener: TcpListener, feeder: Arc<Feeder<C>>) -> std::io::Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let feeder = Arc::clone(&feeder);
        tokio::spawn(async move {
            match feeder.feed(stream).await {
                Ok(rows) => tracing::info!(%remote, rows, "replica done"),
                Err(e) => tracing::info!(%remote, error = %e, "replica disconnected"),
            }
        });
    }
}

#[cfg(test)]
#[path = "feeder_tests.rs"]
mod tests;
