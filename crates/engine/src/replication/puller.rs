// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client side of the replication stream

use crate::error::PullError;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tl_core::{
    FormatError, Handshake, HandshakeReply, Row, RowHeader, MAX_ROW_DATA, ROW_HEADER_SIZE, ROW_MARKER,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct AbortSignal {
    aborted: AtomicBool,
    notify: Notify,
}

/// Cancels [`Puller::recv`] from another task
///
/// The abort is sticky: a read that starts after it fails at once.
#[derive(Clone)]
pub struct AbortHandle(Arc<AbortSignal>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.aborted.store(true, Ordering::Release);
        // a stored permit covers a reader between its flag check and its wait
        self.0.notify.notify_one();
    }
}

pub struct Puller<S> {
    stream: S,
    peer: String,
    version: u32,
    buf: BytesMut,
    abort: Arc<AbortSignal>,
}

impl Puller<TcpStream> {
    pub async fn connect(
        addr: &str,
        handshake: &Handshake,
        timeout: Duration,
    ) -> Result<Self, PullError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        tokio::time::timeout(timeout, Self::handshake(stream, addr, handshake))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))?
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Puller<S> {
    /// Send `handshake` over an established stream and read the reply
    pub async fn handshake(mut stream: S, peer: &str, handshake: &Handshake) -> Result<Self, PullError> {
        stream.write_all(&handshake.encode()?).await?;
        stream.flush().await?;

        let mut header = [0u8; HandshakeReply::HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let len = HandshakeReply::message_len(&header)?;
        let mut raw = vec![0u8; HandshakeReply::HEADER_LEN + len];
        raw[..HandshakeReply::HEADER_LEN].copy_from_slice(&header);
        stream.read_exact(&mut raw[HandshakeReply::HEADER_LEN..]).await?;
        let reply = HandshakeReply::decode(&raw)?;

        if reply.is_rejected() {
            return Err(PullError::Rejected(reply.message));
        }
        if reply.version > handshake.version {
            return Err(PullError::Protocol(format!(
                "feeder answered version {} to a version {} handshake",
                reply.version, handshake.version
            )));
        }
        tracing::info!(peer, version = reply.version, scn = handshake.scn, "replication handshake done");
        Ok(Self {
            stream,
            peer: peer.to_string(),
            version: reply.version,
            buf: BytesMut::with_capacity(READ_CHUNK),
            abort: Arc::new(AbortSignal::default()),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Protocol version the feeder accepted
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort))
    }

    /// Read more bytes from the feeder, returning how many arrived
    pub async fn recv(&mut self) -> Result<usize, PullError> {
        if self.abort.aborted.load(Ordering::Acquire) {
            return Err(PullError::Aborted);
        }
        self.buf.reserve(READ_CHUNK);
        let n = tokio::select! {
            read = self.stream.read_buf(&mut self.buf) => read?,
            _ = self.abort.notify.notified() => return Err(PullError::Aborted),
        };
        if n == 0 {
            return Err(PullError::Closed);
        }
        Ok(n)
    }

    /// Next complete row; checksums are verified before it is returned
    pub async fn recv_row(&mut self) -> Result<Row, PullError> {
        loop {
            if let Some(row) = self.parse_row()? {
                return Ok(row);
            }
            self.recv().await?;
        }
    }

    fn parse_row(&mut self) -> Result<Option<Row>, PullError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let marker = (&self.buf[..4]).get_u32_le();
        if marker != ROW_MARKER {
            return Err(FormatError::BadMarker {
                expected: ROW_MARKER,
                got: marker,
            }
            .into());
        }
        if self.buf.len() < 4 + ROW_HEADER_SIZE {
            return Ok(None);
        }
        let header = RowHeader::decode(&self.buf[4..4 + ROW_HEADER_SIZE])?;
        let len = header.len as usize;
        if len > MAX_ROW_DATA {
            return Err(PullError::Protocol(format!("row of {} bytes exceeds limit", len)));
        }
        let total = 4 + ROW_HEADER_SIZE + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(4 + ROW_HEADER_SIZE);
        Ok(Some(header.finish(frame.freeze())?))
    }

    pub async fn close(mut self) -> Result<(), PullError> {
        self.stream.shutdown().await?;
        tracing::debug!(peer = %self.peer, "puller closed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "puller_tests.rs"]
mod tests;
