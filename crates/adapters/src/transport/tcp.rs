// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed frames over TCP
//!
//! Each frame is `len:u32` little-endian followed by `len` bytes. A reply
//! with the high bit of `len` set carries an error string instead.

use super::{FrameHandler, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

const ERROR_BIT: u32 = 0x8000_0000;
const MAX_FRAME: u32 = 64 << 20;

/// Transport keeping one cached connection per peer
#[derive(Clone)]
pub struct TcpTransport {
    peers: Arc<HashMap<String, SocketAddr>>,
    conns: Arc<HashMap<String, Mutex<Option<TcpStream>>>>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(peers: HashMap<String, SocketAddr>, timeout: Duration) -> Self {
        let conns = peers
            .keys()
            .map(|name| (name.clone(), Mutex::new(None)))
            .collect();
        Self {
            peers: Arc::new(peers),
            conns: Arc::new(conns),
            timeout,
        }
    }

    async fn exchange(
        &self,
        peer: &str,
        addr: SocketAddr,
        slot: &mut Option<TcpStream>,
        frame: &Bytes,
    ) -> Result<Bytes, TransportError> {
        let unreachable = |e: std::io::Error| TransportError::Unreachable(peer.to_string(), e.to_string());
        if slot.is_none() {
            let stream = TcpStream::connect(addr).await.map_err(unreachable)?;
            stream.set_nodelay(true).map_err(unreachable)?;
            *slot = Some(stream);
        }
        let Some(stream) = slot.as_mut() else {
            return Err(TransportError::Unreachable(peer.to_string(), "no connection".to_string()));
        };
        write_frame(stream, frame, false).await.map_err(unreachable)?;
        match read_frame(stream).await.map_err(unreachable)? {
            (reply, false) => Ok(reply),
            (err, true) => Err(TransportError::Remote(
                peer.to_string(),
                String::from_utf8_lossy(&err).into_owned(),
            )),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, peer: &str, frame: Bytes) -> Result<Bytes, TransportError> {
        let addr = *self
            .peers
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        let conn = self
            .conns
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;
        let mut slot = conn.lock().await;

        let result = tokio::time::timeout(self.timeout, self.exchange(peer, addr, &mut slot, &frame)).await;
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                if !matches!(e, TransportError::Remote(..)) {
                    *slot = None;
                }
                Err(e)
            }
            Err(_) => {
                *slot = None;
                Err(TransportError::Timeout(peer.to_string()))
            }
        }
    }
}

/// Accept connections and answer frames until the listener fails
pub async fn serve_frames(
    listener: TcpListener,
    handler: Arc<dyn FrameHandler>,
) -> std::io::Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler).await {
                tracing::debug!(%remote, error = %e, "peer connection closed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<dyn FrameHandler>,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let (frame, _) = read_frame(&mut stream).await?;
        match handler.handle(frame).await {
            Ok(reply) => write_frame(&mut stream, &reply, false).await?,
            Err(msg) => write_frame(&mut stream, msg.as_bytes(), true).await?,
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    out: &mut W,
    frame: &[u8],
    error: bool,
) -> std::io::Result<()> {
    let mut len = frame.len() as u32;
    if error {
        len |= ERROR_BIT;
    }
    out.write_all(&len.to_le_bytes()).await?;
    out.write_all(frame).await?;
    out.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(input: &mut R) -> std::io::Result<(Bytes, bool)> {
    let len = input.read_u32_le().await?;
    let error = len & ERROR_BIT != 0;
    let len = len & !ERROR_BIT;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf).await?;
    Ok((Bytes::from(buf), error))
}

#[cfg(test)]
#[path = "tcp_tests.rs"]
mod tests;
