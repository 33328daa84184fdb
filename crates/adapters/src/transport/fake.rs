// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory network with partition control for tests
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{FrameHandler, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Recorded delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetCall {
    pub from: String,
    pub to: String,
    pub delivered: bool,
}

#[derive(Default)]
struct NetState {
    handlers: HashMap<String, Arc<dyn FrameHandler>>,
    isolated: HashSet<String>,
    calls: Vec<NetCall>,
}

/// Shared in-memory network; hand each node its own [`FakeTransport`]
#[derive(Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: Arc<dyn FrameHandler>) {
        self.lock().handlers.insert(name.to_string(), handler);
    }

    /// Transport that sends as `from`
    pub fn transport(&self, from: &str) -> FakeTransport {
        FakeTransport {
            from: from.to_string(),
            net: self.clone(),
        }
    }

    /// Cut `name` off from every other node
    pub fn isolate(&self, name: &str) {
        self.lock().isolated.insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.lock().isolated.remove(name);
    }

    pub fn calls(&self) -> Vec<NetCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's view of a [`FakeNetwork`]
#[derive(Clone)]
pub struct FakeTransport {
    from: String,
    net: FakeNetwork,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn call(&self, peer: &str, frame: Bytes) -> Result<Bytes, TransportError> {
        let handler = {
            let mut state = self.net.lock();
            let blocked = state.isolated.contains(&self.from) || state.isolated.contains(peer);
            let handler = state.handlers.get(peer).cloned();
            state.calls.push(NetCall {
                from: self.from.clone(),
                to: peer.to_string(),
                delivered: !blocked && handler.is_some(),
            });
            if blocked {
                return Err(TransportError::Unreachable(
                    peer.to_string(),
                    "partitioned".to_string(),
                ));
            }
            handler.ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?
        };
        // Yield so peers interleave like they would over a socket
        tokio::task::yield_now().await;
        handler
            .handle(frame)
            .await
            .map_err(|msg| TransportError::Remote(peer.to_string(), msg))
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
