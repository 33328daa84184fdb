// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration, read from a TOML file
//!
//! Relative paths are resolved against the directory holding the file.
//! A zero duration turns the matching periodic task off.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tl_core::{ShardId, ShardOp, ShardType, MAX_PEERS};
use tl_engine::replication::{FeederConfig, ReplicaConfig, RowFilter};
use tl_engine::{ContextConfig, PaxosConfig, RaftConfig, WalWriterConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("cannot parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("shard {0} is configured twice")]
    DuplicateShard(ShardId),
    #[error("shard {id}: {reason}")]
    Shard { id: ShardId, reason: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub snap_dir: PathBuf,
    pub wal_dir: PathBuf,
    pub log_path: PathBuf,
    /// Rows per WAL file before rotating
    pub rows_per_wal: usize,
    #[serde(with = "humantime_serde")]
    pub wal_fsync_delay: Duration,
    pub wal_writer_inbox_size: usize,
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub run_crc_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub nop_hb_delay: Duration,
    /// How often a hot standby rescans the WAL directory
    #[serde(with = "humantime_serde")]
    pub wal_dir_rescan_delay: Duration,
    pub panic_on_scn_gap: bool,
    /// Tail the WAL directory while another process holds it
    pub hot_standby: bool,
    pub wal_feeder_bind_addr: Option<String>,
    /// Feeder to replicate from; set on replicas only
    pub wal_feeder_addr: Option<String>,
    /// Shards to request from the feeder; all when unset
    pub wal_feeder_filter: Option<Vec<ShardId>>,
    /// This node's name in consensus shard peer lists
    pub name: Option<String>,
    pub peer_bind_addr: Option<String>,
    /// Peer name to `host:port`
    pub peers: BTreeMap<String, String>,
    #[serde(with = "humantime_serde")]
    pub peer_call_timeout: Duration,
    pub shards: Vec<ShardConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snap_dir: PathBuf::from("snap"),
            wal_dir: PathBuf::from("wal"),
            log_path: PathBuf::from("tld.log"),
            rows_per_wal: 50_000,
            wal_fsync_delay: Duration::ZERO,
            wal_writer_inbox_size: 128,
            snapshot_interval: Duration::ZERO,
            run_crc_delay: Duration::from_millis(100),
            nop_hb_delay: Duration::ZERO,
            wal_dir_rescan_delay: Duration::from_millis(100),
            panic_on_scn_gap: true,
            hot_standby: false,
            wal_feeder_bind_addr: None,
            wal_feeder_addr: None,
            wal_feeder_filter: None,
            name: None,
            peer_bind_addr: None,
            peers: BTreeMap::new(),
            peer_call_timeout: Duration::from_millis(500),
            shards: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardConfig {
    pub id: ShardId,
    #[serde(rename = "type")]
    pub shard_type: ShardType,
    #[serde(default = "default_module")]
    pub module: String,
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_module() -> String {
    "hash".to_string()
}

impl ShardConfig {
    pub fn to_op(&self) -> ShardOp {
        ShardOp::new(self.shard_type, self.module.clone(), self.peers.clone())
    }

    pub fn is_consensus(&self) -> bool {
        matches!(self.shard_type, ShardType::Paxos | ShardType::Raft)
    }
}

impl Config {
    /// Read, resolve and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let mut config: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [&mut self.snap_dir, &mut self.wal_dir, &mut self.log_path] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rows_per_wal == 0 {
            return Err(ConfigError::Invalid("rows_per_wal must be positive".to_string()));
        }
        if self.wal_writer_inbox_size == 0 {
            return Err(ConfigError::Invalid(
                "wal_writer_inbox_size must be positive".to_string(),
            ));
        }
        if self.hot_standby && self.wal_feeder_addr.is_some() {
            return Err(ConfigError::Invalid(
                "hot_standby and wal_feeder_addr are exclusive".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.id) {
                return Err(ConfigError::DuplicateShard(shard.id));
            }
            let invalid = |reason: String| ConfigError::Shard { id: shard.id, reason };
            if shard.peers.len() > MAX_PEERS {
                return Err(invalid(format!("more than {} peers", MAX_PEERS)));
            }
            if !shard.is_consensus() {
                continue;
            }
            let name = self
                .name
                .as_deref()
                .ok_or_else(|| invalid("consensus shards need a node name".to_string()))?;
            if !shard.peers.iter().any(|p| p == name) {
                return Err(invalid(format!("{} is not among its peers", name)));
            }
            if let Some(peer) = shard
                .peers
                .iter()
                .find(|p| *p != name && !self.peers.contains_key(*p))
            {
                return Err(invalid(format!("peer {} has no address", peer)));
            }
        }
        Ok(())
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            panic_on_scn_gap: self.panic_on_scn_gap,
            wal: WalWriterConfig {
                rows_per_file: self.rows_per_wal,
                fsync_delay: self.wal_fsync_delay,
                inbox_size: self.wal_writer_inbox_size,
                ..WalWriterConfig::default()
            },
        }
    }

    pub fn feeder_config(&self) -> FeederConfig {
        FeederConfig {
            poll_interval: self.wal_dir_rescan_delay,
            ..FeederConfig::default()
        }
    }

    /// Replica settings, when this node pulls from a feeder
    pub fn replica_config(&self) -> Option<ReplicaConfig> {
        let feeder_addr = self.wal_feeder_addr.clone()?;
        Some(ReplicaConfig {
            feeder_addr,
            filter: self
                .wal_feeder_filter
                .as_deref()
                .map(RowFilter::shard_spec),
            ..ReplicaConfig::default()
        })
    }

    pub fn paxos_config(&self) -> PaxosConfig {
        PaxosConfig {
            call_timeout: self.peer_call_timeout,
            ..PaxosConfig::default()
        }
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            call_timeout: self.peer_call_timeout,
            ..RaftConfig::default()
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
