// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Network listeners: the replication feeder and the peer frame server.

use std::net::SocketAddr;
use std::sync::Arc;

use tl_adapters::{serve_frames, FrameHandler};
use tl_core::SystemClock;
use tl_engine::replication::{serve_feeder, Feeder, FeederConfig};
use tl_engine::{Context, PeerRouter};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::lifecycle::LifecycleError;

/// A bound listener and the task accepting on it
pub struct Server {
    pub addr: SocketAddr,
    pub task: JoinHandle<()>,
}

async fn bind(addr: &str) -> Result<TcpListener, LifecycleError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| LifecycleError::BindFailed(addr.to_string(), e))
}

/// Serve this node's WAL directory to replicas
pub async fn start_feeder(
    ctx: &Context,
    addr: &str,
    config: FeederConfig,
) -> Result<Server, LifecycleError> {
    let listener = bind(addr).await?;
    let addr = listener.local_addr()?;
    let feeder = Arc::new(Feeder::new(ctx.wal_dir().clone(), config, SystemClock));
    let task = tokio::spawn(async move {
        if let Err(e) = serve_feeder(listener, feeder).await {
            error!(%addr, error = %e, "feeder stopped");
        }
    });
    info!(%addr, "feeder listening");
    Ok(Server { addr, task })
}

/// Answer consensus frames from peers, routed by shard
pub async fn start_peers(router: Arc<PeerRouter>, addr: &str) -> Result<Server, LifecycleError> {
    let listener = bind(addr).await?;
    let addr = listener.local_addr()?;
    let handler: Arc<dyn FrameHandler> = router;
    let task = tokio::spawn(async move {
        if let Err(e) = serve_frames(listener, handler).await {
            error!(%addr, error = %e, "peer server stopped");
        }
    });
    info!(%addr, "peer server listening");
    Ok(Server { addr, task })
}
