// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: startup, recovery, role, shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tl_adapters::{TcpTransport, TracedTransport};
use tl_core::{ErrorClass, RunCrcStatus, ShardType, SystemClock};
use tl_engine::replication::{Replica, ReplicaStatus};
use tl_engine::{
    Context, PaxosGroup, PeerRouter, RaftGroup, Recovery, RecoveryError, RecoveryState,
    ShardError, ShardStatus,
};
use tl_storage::{DirLock, LogDir, LogError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::server::{self, Server};

type PeerTransport = TracedTransport<TcpTransport>;

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("log directory: {0}")]
    Log(#[from] LogError),

    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("shard setup failed: {0}")]
    Shard(#[from] ShardError),

    #[error("failed to bind {0}: {1}")]
    BindFailed(String, #[source] std::io::Error),

    #[error("cannot resolve peer {0} at {1}")]
    Resolve(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LifecycleError::Config(_) => ErrorClass::Protocol,
            LifecycleError::Log(e) => e.class(),
            LifecycleError::Recovery(e) => e.class(),
            LifecycleError::Shard(e) => e.class(),
            LifecycleError::BindFailed(..)
            | LifecycleError::Resolve(..)
            | LifecycleError::Io(_) => ErrorClass::TransientIo,
        }
    }
}

/// Running daemon: the engine context plus everything serving it
pub struct Daemon {
    config: Config,
    ctx: Context,
    recovery: Recovery<SystemClock>,
    router: Arc<PeerRouter>,
    // NOTE(lifetime): held to keep the directories exclusive; released on drop
    #[allow(dead_code)]
    locks: Vec<DirLock>,
    standby: bool,
    stop: watch::Sender<bool>,
    feeder: Option<Server>,
    peers: Option<Server>,
    tasks: Vec<JoinHandle<()>>,
    replica: Option<Arc<Replica<SystemClock>>>,
}

/// Lock the log directories and replay them
///
/// A hot standby whose WAL directory is held by another process comes up
/// without the WAL lock; [`Daemon::standby`] then tails the directory
/// until the lock is free.
pub async fn startup(config: &Config) -> Result<Daemon, LifecycleError> {
    let wal_dir = LogDir::wal(&config.wal_dir)?;
    let snap_dir = LogDir::snap(&config.snap_dir)?;

    let (locks, standby) = match lock_dirs(&wal_dir, &snap_dir) {
        Ok(locks) => (locks, false),
        Err(LogError::Locked(path)) if config.hot_standby => {
            info!(dir = %path.display(), "log directory is busy, starting as hot standby");
            (Vec::new(), true)
        }
        Err(e) => return Err(e.into()),
    };

    let ctx = Context::new(SystemClock, wal_dir, snap_dir, config.context_config());
    let mut recovery = Recovery::new(ctx.clone());
    let scns = recovery.load_full(None)?;
    let report = recovery.report();
    info!(
        shards = scns.len(),
        lsn = ctx.applied_lsn(),
        files = report.files,
        rows = report.rows,
        "recovered"
    );
    if let Some(tail) = &report.tail_truncated {
        warn!(
            file = %tail.file.display(),
            offset = tail.offset,
            last_scn = tail.last_scn,
            "recovered up to a truncated wal tail"
        );
    }

    let (stop, _) = watch::channel(false);
    Ok(Daemon {
        config: config.clone(),
        ctx,
        recovery,
        router: Arc::new(PeerRouter::new()),
        locks,
        standby,
        stop,
        feeder: None,
        peers: None,
        tasks: Vec::new(),
        replica: None,
    })
}

/// Lock the WAL directory, then the snapshot directory when it is a
/// different one; either both locks are taken or neither is
fn lock_dirs(wal_dir: &LogDir, snap_dir: &LogDir) -> Result<Vec<DirLock>, LogError> {
    let mut locks = vec![wal_dir.lock()?];
    if !same_dir(snap_dir.path(), wal_dir.path()) {
        locks.push(snap_dir.lock()?);
    }
    Ok(locks)
}

fn same_dir(a: &std::path::Path, b: &std::path::Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

impl Daemon {
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> RecoveryState {
        self.recovery.state()
    }

    /// Still waiting for the WAL directory lock
    pub fn is_standby(&self) -> bool {
        self.standby
    }

    /// Bound feeder address, once serving
    pub fn feeder_addr(&self) -> Option<SocketAddr> {
        self.feeder.as_ref().map(|s| s.addr)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peers.as_ref().map(|s| s.addr)
    }

    pub fn replica_status(&self) -> Option<ReplicaStatus> {
        self.replica.as_ref().map(|r| r.status().borrow().clone())
    }

    pub fn status(&self) -> Vec<ShardStatus> {
        self.ctx.status()
    }

    /// Tail the WAL directory until the lock frees up, then take it
    pub async fn standby(&mut self) -> Result<(), LifecycleError> {
        if !self.standby {
            return Ok(());
        }
        let (promote, promoted) = watch::channel(false);
        let wal_dir = self.ctx.wal_dir().clone();
        let snap_dir = self.ctx.snap_dir().clone();
        let delay = self.config.wal_dir_rescan_delay;
        let waiter: JoinHandle<Vec<DirLock>> = tokio::spawn(async move {
            loop {
                match lock_dirs(&wal_dir, &snap_dir) {
                    Ok(locks) => {
                        let _ = promote.send(true);
                        return locks;
                    }
                    Err(LogError::Locked(_)) => {}
                    Err(e) => warn!(error = %e, "cannot lock log directories"),
                }
                tokio::time::sleep(delay).await;
            }
        });
        let abort = waiter.abort_handle();
        let promoted = self.recovery.hot_standby(delay, promoted).await;
        self.locks = match promoted {
            Ok(_) => waiter.await.map_err(std::io::Error::other)?,
            Err(e) => {
                abort.abort();
                return Err(e.into());
            }
        };
        self.standby = false;
        Ok(())
    }

    /// Become writable and start serving: create configured shards,
    /// start consensus groups, bind listeners, follow the feeder
    pub async fn serve(&mut self) -> Result<(), LifecycleError> {
        if self.recovery.state() != RecoveryState::Primary {
            self.standby().await?;
        }
        if self.recovery.state() != RecoveryState::Primary {
            self.recovery.enter_primary()?;
        }
        self.create_shards().await?;
        self.start_consensus().await?;

        if let Some(addr) = self.config.wal_feeder_bind_addr.clone() {
            let feeder = server::start_feeder(&self.ctx, &addr, self.config.feeder_config()).await?;
            self.feeder = Some(feeder);
        }
        if let Some(addr) = self.config.peer_bind_addr.clone() {
            self.peers = Some(server::start_peers(Arc::clone(&self.router), &addr).await?);
        }
        if let Some(replica_config) = self.config.replica_config() {
            // por shards recovered from the local WAL still belong to the feeder
            for shard in self.ctx.shards().iter().filter(|s| s.shard_type() == ShardType::Por) {
                self.ctx.adopt_replica(shard.id());
            }
            let replica = Arc::new(Replica::new(self.ctx.clone(), replica_config));
            let runner = Arc::clone(&replica);
            let stop = self.stop.subscribe();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = runner.run(stop).await {
                    error!(error = %e, "replica stopped");
                }
            }));
            self.replica = Some(replica);
        }
        info!(state = %self.recovery.state(), shards = self.ctx.shards().len(), "serving");
        Ok(())
    }

    /// Create configured shards that recovery did not bring back
    ///
    /// A replica leaves `por` shards to its feeder.
    async fn create_shards(&self) -> Result<(), LifecycleError> {
        let replica = self.config.wal_feeder_addr.is_some();
        for shard in &self.config.shards {
            let op = shard.to_op();
            if let Some(existing) = self.ctx.shard(shard.id) {
                let meta = existing.meta();
                if meta.shard_type != op.shard_type || meta.module != op.module || meta.peers != op.peers {
                    warn!(
                        shard = shard.id,
                        stored = %meta.shard_type,
                        configured = %op.shard_type,
                        "stored shard differs from config, keeping stored"
                    );
                }
                continue;
            }
            if replica && shard.shard_type == ShardType::Por {
                continue;
            }
            self.ctx.create_shard(shard.id, op).await?;
            info!(shard = shard.id, kind = %shard.shard_type, module = %shard.module, "shard created");
        }
        Ok(())
    }

    async fn start_consensus(&mut self) -> Result<(), LifecycleError> {
        let consensus: Vec<_> = self
            .config
            .shards
            .iter()
            .filter(|s| s.is_consensus())
            .cloned()
            .collect();
        let Some(name) = self.config.name.clone() else {
            return Ok(());
        };
        if consensus.is_empty() {
            return Ok(());
        }
        let transport = self.transport(&name).await?;
        for shard in consensus {
            match shard.shard_type {
                ShardType::Paxos => {
                    PaxosGroup::start(
                        &self.ctx,
                        &self.router,
                        shard.id,
                        &name,
                        transport.clone(),
                        self.config.paxos_config(),
                    )?;
                }
                ShardType::Raft => {
                    let group = RaftGroup::start(
                        &self.ctx,
                        &self.router,
                        shard.id,
                        &name,
                        transport.clone(),
                        self.config.raft_config(),
                    )?;
                    self.tasks.push(group.spawn(self.stop.subscribe()));
                }
                ShardType::Por => {}
            }
        }
        Ok(())
    }

    async fn transport(&self, name: &str) -> Result<PeerTransport, LifecycleError> {
        let mut peers = HashMap::new();
        for (peer, addr) in &self.config.peers {
            let resolved = tokio::net::lookup_host(addr.as_str())
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .ok_or_else(|| LifecycleError::Resolve(peer.clone(), addr.clone()))?;
            peers.insert(peer.clone(), resolved);
        }
        let tcp = TcpTransport::new(peers, self.config.peer_call_timeout);
        Ok(TracedTransport::new(tcp, name))
    }

    /// Declare every shard's run-CRC
    pub async fn write_run_crc(&self) {
        if let Err(e) = self.ctx.write_run_crc().await {
            warn!(error = %e, "run_crc rows not written");
        }
    }

    pub async fn write_nop(&self) {
        if let Err(e) = self.ctx.write_nop().await {
            warn!(error = %e, "nop rows not written");
        }
    }

    pub async fn snapshot(&self) -> Option<PathBuf> {
        match self.recovery.fork_and_snapshot().await {
            Ok(Some(path)) => {
                info!(path = %path.display(), "snapshot written");
                Some(path)
            }
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, class = e.class().as_str(), "snapshot failed");
                None
            }
        }
    }

    /// Log shards that report an error or a run-CRC divergence
    pub fn report_status(&self) {
        for status in self.status() {
            if status.last_error.is_some() || status.run_crc == RunCrcStatus::Mismatch {
                warn!(%status, "shard needs attention");
            }
        }
    }

    /// Shutdown the daemon gracefully
    pub async fn shutdown(mut self) {
        info!("Shutting down daemon...");

        // 1. Stop timers and the replica
        let _ = self.stop.send(true);

        // 2. Stop accepting connections
        for server in [self.feeder.take(), self.peers.take()].into_iter().flatten() {
            server.task.abort();
        }

        // 3. Wait for tasks to notice the stop
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "task ended abnormally");
            }
        }

        // 4. Seal the current WAL file; locks are released on drop
        self.ctx.shutdown().await;
        info!("Daemon shutdown complete");
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
