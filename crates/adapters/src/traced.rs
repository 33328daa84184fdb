// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Traced transport wrapper for consistent observability

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::Instrument;

/// Wrapper that adds a span and timing to every peer call
#[derive(Clone)]
pub struct TracedTransport<T> {
    inner: T,
    local: String,
}

impl<T> TracedTransport<T> {
    pub fn new(inner: T, local: impl Into<String>) -> Self {
        Self {
            inner,
            local: local.into(),
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for TracedTransport<T> {
    async fn call(&self, peer: &str, frame: Bytes) -> Result<Bytes, TransportError> {
        let span = tracing::debug_span!("peer.call", from = %self.local, to = peer);
        async {
            tracing::trace!(frame_len = frame.len(), "sending");
            let start = std::time::Instant::now();
            let result = self.inner.call(peer, frame).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(reply) => tracing::trace!(reply_len = reply.len(), elapsed_ms, "replied"),
                // Unreachable peers are routine during partitions
                Err(e @ TransportError::Unreachable(..)) | Err(e @ TransportError::Timeout(_)) => {
                    tracing::debug!(error = %e, elapsed_ms, "call failed")
                }
                Err(e) => tracing::warn!(error = %e, elapsed_ms, "call failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[path = "traced_tests.rs"]
mod tests;
