// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replica: keeps a puller connected and applies what it receives
//!
//! Disconnects and corrupt rows are retried with exponential backoff.
//! A rejected handshake or protocol error stops the replica for good and
//! is published in its status.

use super::{is_ping, Puller};
use crate::context::Context;
use crate::error::PullError;
use std::fmt;
use std::time::Duration;
use tl_core::{Clock, ErrorClass, FilterSpec, Handshake, Scn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Feeder address, `host:port`
    pub feeder_addr: String,
    pub filter: Option<FilterSpec>,
    pub connect_timeout: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            feeder_addr: String::new(),
            filter: None,
            connect_timeout: Duration::from_secs(5),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaStatus {
    Connecting,
    Connected { scn: Scn },
    Backoff { attempt: u32, class: ErrorClass, error: String },
    Failed { class: ErrorClass, error: String },
    Stopped,
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaStatus::Connecting => f.write_str("connecting"),
            ReplicaStatus::Connected { scn } => write!(f, "connected from scn {}", scn),
            ReplicaStatus::Backoff {
                attempt,
                class,
                error,
            } => write!(f, "retry {} after {}: {}", attempt, class.as_str(), error),
            ReplicaStatus::Failed { class, error } => {
                write!(f, "failed ({}): {}", class.as_str(), error)
            }
            ReplicaStatus::Stopped => f.write_str("stopped"),
        }
    }
}

pub struct Replica<C: Clock> {
    ctx: Context<C>,
    config: ReplicaConfig,
    status: watch::Sender<ReplicaStatus>,
}

impl<C: Clock> Replica<C> {
    pub fn new(ctx: Context<C>, config: ReplicaConfig) -> Self {
        let (status, _) = watch::channel(ReplicaStatus::Connecting);
        Self {
            ctx,
            config,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<ReplicaStatus> {
        self.status.subscribe()
    }

    /// Scn to ask the feeder for: the lowest among local shards
    fn resume_scn(&self) -> Scn {
        self.ctx.scns().values().copied().min().unwrap_or(0)
    }

    fn handshake(&self) -> Handshake {
        Handshake::new(self.resume_scn(), self.config.filter.clone())
    }

    /// Pull until `stop` turns true or a fatal error occurs
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), PullError> {
        let mut attempt = 0u32;
        loop {
            if *stop.borrow() {
                break;
            }
            self.status.send_replace(ReplicaStatus::Connecting);
            let session = async {
                let puller = Puller::connect(
                    &self.config.feeder_addr,
                    &self.handshake(),
                    self.config.connect_timeout,
                )
                .await?;
                attempt = 0;
                self.pull(puller).await
            };
            let result = tokio::select! {
                result = session => result,
                _ = stop.changed() => break,
            };
            let Err(e) = result else {
                continue;
            };
            if e.is_fatal() {
                tracing::error!(feeder = %self.config.feeder_addr, error = %e, "replication stopped");
                self.status.send_replace(ReplicaStatus::Failed {
                    class: e.class(),
                    error: e.to_string(),
                });
                return Err(e);
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff(self.config.min_backoff, self.config.max_backoff, attempt);
            tracing::warn!(
                feeder = %self.config.feeder_addr,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "replication interrupted"
            );
            self.status.send_replace(ReplicaStatus::Backoff {
                attempt,
                class: e.class(),
                error: e.to_string(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }
        self.status.send_replace(ReplicaStatus::Stopped);
        Ok(())
    }

    /// Handshake over an established stream and apply rows until it fails
    pub async fn follow<S>(&self, stream: S) -> Result<(), PullError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let puller = Puller::handshake(stream, &self.config.feeder_addr, &self.handshake()).await?;
        self.pull(puller).await
    }

    async fn pull<S>(&self, mut puller: Puller<S>) -> Result<(), PullError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.status.send_replace(ReplicaStatus::Connected {
            scn: self.resume_scn(),
        });
        loop {
            let row = puller.recv_row().await?;
            if is_ping(&row) {
                continue;
            }
            let shard = row.shard_id;
            if let Err(e) = self.ctx.apply_remote(row).await {
                if let Some(s) = self.ctx.shard(shard) {
                    s.record_error(e.class());
                }
                return Err(e.into());
            }
        }
    }
}

fn backoff(min: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    min.saturating_mul(factor).min(max)
}

#[cfg(test)]
#[path = "replica_tests.rs"]
mod tests;
