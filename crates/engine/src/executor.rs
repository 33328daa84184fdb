// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Executors interpret data row payloads
//!
//! The log core never looks inside a payload; it hands confirmed rows to
//! the shard's executor. Two reference executors are provided, both
//! storing the key/value operations encoded by [`KvOp`].

use crate::error::ShardError;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tl_core::{KvOp, Tag};

/// Storage engine attached to a shard
pub trait Executor: Send + Sync {
    fn module(&self) -> &'static str;

    /// Apply one confirmed data row
    fn apply(&mut self, payload: &[u8], tag: Tag) -> Result<(), ShardError>;

    /// Number of rows [`Executor::snapshot_write_rows`] will produce
    fn snapshot_estimate(&self) -> usize;

    /// Emit the state as `snap_data` payloads
    fn snapshot_write_rows(
        &self,
        sink: &mut dyn FnMut(Bytes) -> Result<(), ShardError>,
    ) -> Result<(), ShardError>;

    /// Checksum over the logical state, independent of history
    fn state_crc(&self) -> u32;

    /// Copy for snapshotting while the original keeps serving
    fn box_clone(&self) -> Box<dyn Executor>;

    fn get(&self, key: &[u8]) -> Option<Bytes>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the executor registered under `module`
pub fn make_executor(module: &str) -> Result<Box<dyn Executor>, ShardError> {
    match module {
        HashExecutor::MODULE => Ok(Box::new(HashExecutor::default())),
        TreeExecutor::MODULE => Ok(Box::new(TreeExecutor::default())),
        other => Err(ShardError::UnknownModule(other.to_string())),
    }
}

/// Order-sensitive checksum over encoded entries
fn crc_of<'a>(entries: impl Iterator<Item = (&'a Bytes, &'a Bytes)>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (key, val) in entries {
        hasher.update(&(key.len() as u32).to_le_bytes());
        hasher.update(key);
        hasher.update(&(val.len() as u32).to_le_bytes());
        hasher.update(val);
    }
    hasher.finalize()
}

/// Unordered key/value executor
#[derive(Debug, Clone, Default)]
pub struct HashExecutor {
    map: HashMap<Bytes, Bytes>,
}

impl HashExecutor {
    pub const MODULE: &'static str = "hash";
}

impl Executor for HashExecutor {
    fn module(&self) -> &'static str {
        Self::MODULE
    }

    fn apply(&mut self, payload: &[u8], _tag: Tag) -> Result<(), ShardError> {
        match KvOp::decode(payload)? {
            KvOp::Put { key, val } => {
                self.map.insert(key, val);
            }
            KvOp::Delete { key } => {
                self.map.remove(&key);
            }
        }
        Ok(())
    }

    fn snapshot_estimate(&self) -> usize {
        self.map.len()
    }

    fn snapshot_write_rows(
        &self,
        sink: &mut dyn FnMut(Bytes) -> Result<(), ShardError>,
    ) -> Result<(), ShardError> {
        for (key, val) in &self.map {
            sink(KvOp::put(key.clone(), val.clone()).encode())?;
        }
        Ok(())
    }

    fn state_crc(&self) -> u32 {
        let mut entries: Vec<_> = self.map.iter().collect();
        entries.sort();
        crc_of(entries.into_iter())
    }

    fn box_clone(&self) -> Box<dyn Executor> {
        Box::new(self.clone())
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.map.get(key).cloned()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Ordered key/value executor
#[derive(Debug, Clone, Default)]
pub struct TreeExecutor {
    map: BTreeMap<Bytes, Bytes>,
}

impl TreeExecutor {
    pub const MODULE: &'static str = "tree";

    /// Entries with keys in `[from, ..)`, in key order
    pub fn range_from(&self, from: &[u8]) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.map.range(Bytes::copy_from_slice(from)..)
    }
}

impl Executor for TreeExecutor {
    fn module(&self) -> &'static str {
        Self::MODULE
    }

    fn apply(&mut self, payload: &[u8], _tag: Tag) -> Result<(), ShardError> {
        match KvOp::decode(payload)? {
            KvOp::Put { key, val } => {
                self.map.insert(key, val);
            }
            KvOp::Delete { key } => {
                self.map.remove(&key);
            }
        }
        Ok(())
    }

    fn snapshot_estimate(&self) -> usize {
        self.map.len()
    }

    fn snapshot_write_rows(
        &self,
        sink: &mut dyn FnMut(Bytes) -> Result<(), ShardError>,
    ) -> Result<(), ShardError> {
        for (key, val) in &self.map {
            sink(KvOp::put(key.clone(), val.clone()).encode())?;
        }
        Ok(())
    }

    fn state_crc(&self) -> u32 {
        crc_of(self.map.iter())
    }

    fn box_clone(&self) -> Box<dyn Executor> {
        Box::new(self.clone())
    }

    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.map.get(key).cloned()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
