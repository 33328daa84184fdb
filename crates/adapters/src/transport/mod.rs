// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request/reply frame transport between replicas

mod tcp;

pub use tcp::{serve_frames, TcpTransport};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeNetwork, FakeTransport, NetCall};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tl_core::ErrorClass;

/// Errors from peer calls
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("peer {0} unknown")]
    UnknownPeer(String),
    #[error("peer {0} unreachable: {1}")]
    Unreachable(String, String),
    #[error("call to {0} timed out")]
    Timeout(String),
    #[error("peer {0} failed to handle frame: {1}")]
    Remote(String, String),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::UnknownPeer(_) => ErrorClass::Protocol,
            _ => ErrorClass::TransientIo,
        }
    }
}

/// Client side: deliver one frame to a named peer and await its reply
#[async_trait]
pub trait Transport: Clone + Send + Sync + 'static {
    async fn call(&self, peer: &str, frame: Bytes) -> Result<Bytes, TransportError>;
}

/// Server side: answer one frame
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle(&self, frame: Bytes) -> Result<Bytes, String>;
}
