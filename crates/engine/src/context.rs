// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine context: the owner of shards, log directories and the writer
//!
//! Every component takes a [`Context`] handle instead of reaching for
//! globals. Confirmed WAL rows are applied here, under the read side of a
//! pool-level lock; snapshotting takes the write side only while it copies
//! shard state.

use crate::error::{ShardError, WalError};
use crate::executor::make_executor;
use crate::shard::{Applied, PrimaryConsensus, Shard, ShardConsensus, ShardImage, ShardStatus};
use crate::wal::{ConfirmSink, Pack, WalWriter, WalWriterConfig};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};
use tl_core::{Clock, Lsn, Row, Scn, ShardId, ShardOp, ShardType, SystemClock, Tag, TagKind};
use tl_storage::{LogDir, LogError};

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Treat an scn gap while applying as an error
    pub panic_on_scn_gap: bool,
    pub wal: WalWriterConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            panic_on_scn_gap: true,
            wal: WalWriterConfig::default(),
        }
    }
}

/// Where a row being applied came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Snapshot load: `shard_create` rows carry position and checksums
    Snapshot,
    /// Local WAL replay at boot or in hot standby
    Recovery,
    /// Confirmed by the running writer
    Live,
    /// Received from a feeder and not stored locally
    Remote,
}

/// Rows and consistent position copied for one snapshot
pub struct SnapshotView {
    /// Last WAL lsn reflected in the images
    pub lsn: Lsn,
    pub shards: Vec<ShardImage>,
}

struct ContextInner<C: Clock> {
    clock: C,
    wal_dir: LogDir,
    snap_dir: LogDir,
    config: ContextConfig,
    shards: RwLock<BTreeMap<ShardId, Arc<Shard>>>,
    consensus: Mutex<BTreeMap<ShardId, Arc<dyn ShardConsensus>>>,
    /// Shards a replication source owns, including ones not created yet
    replicas: Mutex<BTreeSet<ShardId>>,
    /// Held for reading while rows apply, for writing while a snapshot copies
    pool: RwLock<()>,
    applied_lsn: AtomicI64,
    wal: OnceLock<WalWriter>,
}

#[derive(Clone)]
pub struct Context<C: Clock = SystemClock> {
    inner: Arc<ContextInner<C>>,
}

impl<C: Clock> Context<C> {
    pub fn new(clock: C, wal_dir: LogDir, snap_dir: LogDir, config: ContextConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                clock,
                wal_dir,
                snap_dir,
                config,
                shards: RwLock::new(BTreeMap::new()),
                consensus: Mutex::new(BTreeMap::new()),
                replicas: Mutex::new(BTreeSet::new()),
                pool: RwLock::new(()),
                applied_lsn: AtomicI64::new(0),
                wal: OnceLock::new(),
            }),
        }
    }

    pub fn clock(&self) -> &C {
        &self.inner.clock
    }

    pub fn wal_dir(&self) -> &LogDir {
        &self.inner.wal_dir
    }

    pub fn snap_dir(&self) -> &LogDir {
        &self.inner.snap_dir
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    pub fn shard(&self, id: ShardId) -> Option<Arc<Shard>> {
        self.inner.read_shards().get(&id).cloned()
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.inner.read_shards().values().cloned().collect()
    }

    /// Applied scn of every shard
    pub fn scns(&self) -> BTreeMap<ShardId, Scn> {
        self.inner
            .read_shards()
            .iter()
            .map(|(id, shard)| (*id, shard.scn()))
            .collect()
    }

    /// Highest local WAL lsn applied to shard state
    pub fn applied_lsn(&self) -> Lsn {
        self.inner.applied_lsn.load(Ordering::SeqCst)
    }

    pub fn set_applied_lsn(&self, lsn: Lsn) {
        self.inner.applied_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn apply_row(&self, row: &Row, mode: ApplyMode) -> Result<Applied, ShardError> {
        let _pool = self.inner.pool.read().unwrap_or_else(|e| e.into_inner());
        self.inner.apply_row(row, mode)
    }

    /// Start the WAL writer after recovery and attach local consensus to
    /// every `por` shard
    pub fn start_wal(&self) -> Result<WalWriter, LogError> {
        if let Some(wal) = self.inner.wal.get() {
            return Ok(wal.clone());
        }
        let sink: Arc<dyn ConfirmSink> = Arc::new(ApplySink(Arc::downgrade(&self.inner)));
        let wal = WalWriter::start(
            self.inner.wal_dir.clone(),
            self.inner.config.wal.clone(),
            self.applied_lsn(),
            sink,
        )?;
        let wal = self.inner.wal.get_or_init(|| wal).clone();
        for shard in self.shards() {
            self.inner.attach_primary(&shard);
        }
        Ok(wal)
    }

    pub fn wal(&self) -> Option<WalWriter> {
        self.inner.wal.get().cloned()
    }

    fn require_wal(&self) -> Result<WalWriter, ShardError> {
        self.wal().ok_or(ShardError::Wal(WalError::Shutdown))
    }

    /// Attach a consensus group to a shard; the context keeps it alive
    pub fn attach(
        &self,
        id: ShardId,
        consensus: Arc<dyn ShardConsensus>,
    ) -> Result<(), ShardError> {
        let shard = self.shard(id).ok_or(ShardError::UnknownShard(id))?;
        shard.attach(&consensus);
        self.inner
            .consensus
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, consensus);
        Ok(())
    }

    /// Log a `shard_create` row and return the shard once it is applied
    pub async fn create_shard(&self, id: ShardId, op: ShardOp) -> Result<Arc<Shard>, ShardError> {
        if self.shard(id).is_some() {
            return Err(ShardError::ShardExists(id));
        }
        make_executor(&op.module)?;
        self.write_shard_op(id, 0, TagKind::ShardCreate, op.encode()?).await?;
        self.shard(id).ok_or(ShardError::UnknownShard(id))
    }

    pub async fn alter_shard(&self, id: ShardId, op: ShardOp) -> Result<(), ShardError> {
        let shard = self.shard(id).ok_or(ShardError::UnknownShard(id))?;
        if shard.is_final() {
            return Err(ShardError::Final(id));
        }
        self.write_shard_op(id, shard.scn(), TagKind::ShardAlter, op.encode()?).await
    }

    /// Mark a shard final; it stays readable but accepts no writes
    pub async fn drop_shard(&self, id: ShardId) -> Result<(), ShardError> {
        let shard = self.shard(id).ok_or(ShardError::UnknownShard(id))?;
        if shard.is_final() {
            return Ok(());
        }
        self.write_shard_op(id, shard.scn(), TagKind::ShardFinal, Bytes::new()).await
    }

    /// Shard ops carry the shard's current scn so feeders forward them to
    /// replicas that are already past the create
    async fn write_shard_op(
        &self,
        id: ShardId,
        scn: Scn,
        kind: TagKind,
        data: Bytes,
    ) -> Result<(), ShardError> {
        let wal = self.require_wal()?;
        let row = Row::new(Tag::sys(kind), id, scn, data).with_tm(self.inner.clock.wall());
        wal.submit(Pack::single(row)).await?;
        Ok(())
    }

    /// Submit a data payload through the shard's consensus group
    pub async fn submit(&self, id: ShardId, tag: Tag, payload: Bytes) -> Result<Scn, ShardError> {
        let shard = self.shard(id).ok_or(ShardError::UnknownShard(id))?;
        shard.submit(tag, payload).await
    }

    /// Leave a shard's writes to a replication source
    ///
    /// Local submits fail with [`ShardError::Replica`] until [`Self::promote`].
    /// The mark also covers a shard the source has yet to create.
    pub fn adopt_replica(&self, id: ShardId) {
        self.inner.lock_replicas().insert(id);
        if let Some(shard) = self.shard(id) {
            shard.set_replica(true);
        }
    }

    /// Take write ownership of replicated shards back, returning their ids
    pub fn promote(&self) -> Vec<ShardId> {
        let ids: Vec<ShardId> = std::mem::take(&mut *self.inner.lock_replicas())
            .into_iter()
            .collect();
        for id in &ids {
            if let Some(shard) = self.shard(*id) {
                shard.set_replica(false);
            }
        }
        if !ids.is_empty() {
            tracing::info!(shards = ?ids, "replicated shards promoted");
        }
        ids
    }

    /// Apply a row received from a feeder, storing it locally when this
    /// node runs a writer
    ///
    /// The row's shard becomes replica-owned.
    pub async fn apply_remote(&self, row: Row) -> Result<Applied, ShardError> {
        self.adopt_replica(row.shard_id);
        let Some(wal) = self.wal() else {
            return self.apply_row(&row, ApplyMode::Remote);
        };
        let shard = self.shard(row.shard_id);
        if let Some(shard) = &shard {
            if row.tag.kind().is_data() && row.scn <= shard.scn() {
                return Ok(Applied::Duplicate);
            }
        }
        let permit = wal.reserve().await?;
        let ticket = match shard {
            Some(shard) => shard.enqueue_row(&wal, permit, row)?,
            None => wal.enqueue(permit, Pack::single(row))?,
        };
        ticket.wait().await?;
        Ok(Applied::Data)
    }

    /// Declare every live shard's run-CRC in the WAL
    pub async fn write_run_crc(&self) -> Result<usize, ShardError> {
        let now = self.inner.clock.wall();
        self.write_sys_rows(|shard| shard.run_crc_row(now)).await
    }

    /// Heartbeat every live shard so replicas see lag on idle shards
    pub async fn write_nop(&self) -> Result<usize, ShardError> {
        let now = self.inner.clock.wall();
        self.write_sys_rows(|shard| shard.nop_row(now)).await
    }

    async fn write_sys_rows(&self, make: impl Fn(&Shard) -> Row) -> Result<usize, ShardError> {
        let wal = self.require_wal()?;
        let mut pack = wal.pack_prepare();
        for shard in self.shards().iter().filter(|s| !s.is_final()) {
            wal.pack_append_row(&mut pack, make(shard))?;
        }
        let rows = pack.len();
        wal.submit(pack).await?;
        Ok(rows)
    }

    pub fn status(&self) -> Vec<ShardStatus> {
        let now = self.inner.clock.wall();
        self.shards().iter().map(|s| s.status(now)).collect()
    }

    /// Copy every shard under the pool write lock
    ///
    /// No row is applied while the copy runs, so the images all reflect
    /// exactly the rows up to the returned lsn.
    pub fn snapshot_view(&self) -> SnapshotView {
        let _pool = self.inner.pool.write().unwrap_or_else(|e| e.into_inner());
        SnapshotView {
            lsn: self.applied_lsn(),
            shards: self.shards().iter().map(|s| s.image()).collect(),
        }
    }

    /// Stop the writer, sealing the current WAL file
    pub async fn shutdown(&self) {
        if let Some(wal) = self.wal() {
            wal.shutdown().await;
        }
    }
}

impl<C: Clock> ContextInner<C> {
    fn read_shards(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ShardId, Arc<Shard>>> {
        self.shards.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_replicas(&self) -> MutexGuard<'_, BTreeSet<ShardId>> {
        self.replicas.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_row(&self, row: &Row, mode: ApplyMode) -> Result<Applied, ShardError> {
        let applied = match row.tag.kind() {
            TagKind::ShardCreate => self.apply_create(row, mode)?,
            TagKind::SnapInitial | TagKind::SnapFinal | TagKind::WalFinal => Applied::Meta,
            kind => match self.read_shards().get(&row.shard_id).cloned() {
                Some(shard) => {
                    let collect = matches!(mode, ApplyMode::Snapshot | ApplyMode::Recovery);
                    shard.apply_row(row, self.clock.wall(), collect)?
                }
                None if kind.is_data() => return Err(ShardError::UnknownShard(row.shard_id)),
                None => {
                    tracing::debug!(shard = row.shard_id, tag = %row.tag, "row for unknown shard");
                    Applied::Meta
                }
            },
        };
        if matches!(mode, ApplyMode::Recovery | ApplyMode::Live) {
            self.applied_lsn.fetch_max(row.lsn, Ordering::SeqCst);
        }
        Ok(applied)
    }

    fn apply_create(&self, row: &Row, mode: ApplyMode) -> Result<Applied, ShardError> {
        let op = ShardOp::decode(&row.data)?;
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        if shards.contains_key(&row.shard_id) {
            if mode == ApplyMode::Snapshot {
                return Err(ShardError::ShardExists(row.shard_id));
            }
            tracing::debug!(shard = row.shard_id, "shard already exists");
            return Ok(Applied::Duplicate);
        }
        let executor = make_executor(&op.module)?;
        let shard = Arc::new(Shard::new(
            row.shard_id,
            op.clone(),
            executor,
            self.config.panic_on_scn_gap,
        ));
        if mode == ApplyMode::Snapshot {
            shard.restore(row.scn, row.aux.as_run_crc(), module_crc(&op));
        }
        if mode == ApplyMode::Remote || self.lock_replicas().contains(&row.shard_id) {
            shard.set_replica(true);
        }
        shards.insert(row.shard_id, Arc::clone(&shard));
        drop(shards);

        tracing::info!(
            shard = row.shard_id,
            shard_type = %op.shard_type,
            module = %op.module,
            scn = row.scn,
            "shard created"
        );
        self.attach_primary(&shard);
        Ok(Applied::Meta)
    }

    fn attach_primary(&self, shard: &Arc<Shard>) {
        if shard.shard_type() != ShardType::Por || shard.consensus().is_some() {
            return;
        }
        let Some(wal) = self.wal.get() else {
            return;
        };
        let consensus: Arc<dyn ShardConsensus> = Arc::new(PrimaryConsensus::new(
            Arc::clone(shard),
            wal.clone(),
            self.clock.clone(),
        ));
        shard.attach(&consensus);
        self.consensus
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(shard.id(), consensus);
    }
}

/// Executor checksum stored in a snapshot's `shard_create` aux blob
pub(crate) fn module_crc(op: &ShardOp) -> u32 {
    match op.aux.get(..4) {
        Some(raw) => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        None => 0,
    }
}

/// Applies confirmed rows without keeping the context alive
struct ApplySink<C: Clock>(Weak<ContextInner<C>>);

impl<C: Clock> ConfirmSink for ApplySink<C> {
    fn confirmed(&self, rows: &[Row]) -> Result<(), String> {
        let Some(inner) = self.0.upgrade() else {
            return Err("context dropped".to_string());
        };
        let _pool = inner.pool.read().unwrap_or_else(|e| e.into_inner());
        let mut first_error = None;
        for row in rows {
            if let Err(e) = inner.apply_row(row, ApplyMode::Live) {
                tracing::error!(lsn = row.lsn, shard = row.shard_id, error = %e, "confirmed row not applied");
                first_error.get_or_insert(e.to_string());
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
