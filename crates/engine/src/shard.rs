// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shards: identity, applied position, run-CRC and executor
//!
//! A shard's state sits behind one `std::sync::Mutex` that is never held
//! across an `.await`. Writes reserve their scn and enqueue into the WAL
//! writer under that lock, so lsn order and scn order agree for every
//! shard; the row is applied when the writer confirms it.

use crate::error::ShardError;
use crate::executor::Executor;
use crate::wal::{InboxPermit, Pack, WalTicket, WalWriter};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tl_core::{
    ErrorClass, FormatError, Row, RowAux, RunCrc, RunCrcEntry, RunCrcRecord, RunCrcStatus, Scn,
    ShardId, ShardOp, ShardType, Tag, TagKind, TagType, Verification,
};

/// Orders writes for one shard and returns once they are applied locally
#[async_trait]
pub trait ShardConsensus: Send + Sync {
    async fn submit(&self, tag: Tag, payload: Bytes) -> Result<Scn, ShardError>;

    /// Short description for status output, such as the current leader
    fn describe(&self) -> String;

    /// Rows that rebuild this group's durable state, written into snapshots
    fn snapshot_rows(&self) -> Vec<Row> {
        Vec::new()
    }
}

/// What [`Shard::apply_row`] did with a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Executor state or shard metadata changed
    Data,
    /// Metadata or monitoring row
    Meta,
    /// Already applied; scn at or below the shard's position
    Duplicate,
    /// Consensus bookkeeping, kept for the consensus module
    Consensus,
}

struct ShardState {
    meta: ShardOp,
    /// Last applied scn
    scn: Scn,
    /// Last scn handed out to a writer
    reserved_scn: Scn,
    executor: Box<dyn Executor>,
    run_crc: RunCrc,
    lag: f64,
    last_error: Option<ErrorClass>,
    is_final: bool,
    /// Fed by a replication source; local writes are refused
    replica: bool,
    consensus_rows: Vec<Row>,
}

pub struct Shard {
    id: ShardId,
    panic_on_scn_gap: bool,
    state: Mutex<ShardState>,
    consensus: OnceLock<Weak<dyn ShardConsensus>>,
}

impl Shard {
    pub fn new(
        id: ShardId,
        meta: ShardOp,
        executor: Box<dyn Executor>,
        panic_on_scn_gap: bool,
    ) -> Self {
        Self {
            id,
            panic_on_scn_gap,
            state: Mutex::new(ShardState {
                meta,
                scn: 0,
                reserved_scn: 0,
                executor,
                run_crc: RunCrc::default(),
                lag: 0.0,
                last_error: None,
                is_final: false,
                replica: false,
                consensus_rows: Vec::new(),
            }),
            consensus: OnceLock::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn meta(&self) -> ShardOp {
        self.lock().meta.clone()
    }

    pub fn shard_type(&self) -> ShardType {
        self.lock().meta.shard_type
    }

    pub fn scn(&self) -> Scn {
        self.lock().scn
    }

    pub fn is_final(&self) -> bool {
        self.lock().is_final
    }

    pub fn lag(&self) -> f64 {
        self.lock().lag
    }

    pub fn last_error(&self) -> Option<ErrorClass> {
        self.lock().last_error
    }

    pub fn is_replica(&self) -> bool {
        self.lock().replica
    }

    /// Hand write ownership to a replication source, or take it back
    pub fn set_replica(&self, replica: bool) {
        let mut st = self.lock();
        if st.replica != replica {
            tracing::info!(shard = self.id, replica, "shard ownership changed");
        }
        st.replica = replica;
    }

    pub fn record_error(&self, class: ErrorClass) {
        self.lock().last_error = Some(class);
    }

    /// Restore position and checksums, as loaded from a snapshot
    pub fn restore(&self, scn: Scn, run_crc: u32, run_crc_mod: u32) {
        let mut st = self.lock();
        st.scn = scn;
        st.reserved_scn = scn;
        st.run_crc = RunCrc::new(run_crc);
        st.run_crc.set_module_value(run_crc_mod);
        st.run_crc.record(RunCrcEntry { scn, crc: run_crc });
    }

    /// Read a value from the executor
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.lock().executor.get(key)
    }

    pub fn len(&self) -> usize {
        self.lock().executor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach the consensus group that orders this shard's writes
    ///
    /// The shard keeps only a weak reference; the owner of the group keeps
    /// it alive. A second attach is ignored.
    pub fn attach(&self, consensus: &Arc<dyn ShardConsensus>) {
        if self.consensus.set(Arc::downgrade(consensus)).is_err() {
            tracing::warn!(shard = self.id, "consensus already attached");
        }
    }

    pub fn consensus(&self) -> Option<Arc<dyn ShardConsensus>> {
        self.consensus.get().and_then(Weak::upgrade)
    }

    /// Submit a payload through the attached consensus group
    pub async fn submit(&self, tag: Tag, payload: Bytes) -> Result<Scn, ShardError> {
        {
            let st = self.lock();
            if st.is_final {
                return Err(ShardError::Final(self.id));
            }
            if st.replica {
                return Err(ShardError::Replica(self.id));
            }
        }
        let tag = tag.with_default_type(TagType::Wal);
        if !tag.kind().is_data() {
            return Err(ShardError::Payload(FormatError::BadTag(tag.raw())));
        }
        let consensus = self.consensus().ok_or(ShardError::Detached(self.id))?;
        let result = consensus.submit(tag, payload).await;
        if let Err(e) = &result {
            self.record_error(e.class());
        }
        result
    }

    /// Reserve the next scn and enqueue a data row for it
    pub fn enqueue_data(
        &self,
        wal: &WalWriter,
        permit: InboxPermit,
        tag: Tag,
        payload: Bytes,
        tm: f64,
    ) -> Result<(Scn, WalTicket), ShardError> {
        let mut st = self.lock();
        if st.is_final {
            return Err(ShardError::Final(self.id));
        }
        let scn = st.reserved_scn + 1;
        let row = Row::new(tag, self.id, scn, payload).with_tm(tm);
        let ticket = wal.enqueue(permit, Pack::single(row))?;
        st.reserved_scn = scn;
        Ok((scn, ticket))
    }

    /// Enqueue a row whose scn was decided elsewhere
    pub fn enqueue_row(
        &self,
        wal: &WalWriter,
        permit: InboxPermit,
        row: Row,
    ) -> Result<WalTicket, ShardError> {
        let mut st = self.lock();
        let scn = row.scn;
        let is_data = row.tag.kind().is_data();
        let ticket = wal.enqueue(permit, Pack::single(row))?;
        if is_data {
            st.reserved_scn = st.reserved_scn.max(scn);
        }
        Ok(ticket)
    }

    /// Apply one confirmed row
    ///
    /// `collect_consensus` keeps consensus bookkeeping rows for the
    /// consensus module to rebuild from after recovery.
    pub fn apply_row(
        &self,
        row: &Row,
        now: f64,
        collect_consensus: bool,
    ) -> Result<Applied, ShardError> {
        let mut st = self.lock();
        let result = self.apply_locked(&mut st, row, now, collect_consensus);
        if let Err(e) = &result {
            st.last_error = Some(e.class());
        }
        result
    }

    fn apply_locked(
        &self,
        st: &mut ShardState,
        row: &Row,
        now: f64,
        collect_consensus: bool,
    ) -> Result<Applied, ShardError> {
        if row.tm > 0.0 {
            st.lag = (now - row.tm).max(0.0);
        }
        let kind = row.tag.kind();
        match kind {
            TagKind::SnapData => {
                st.executor.apply(&row.data, row.tag)?;
                Ok(Applied::Data)
            }
            _ if kind.is_data() => self.apply_data(st, row),
            TagKind::RunCrc => {
                let record = RunCrcRecord::decode(&row.data)?;
                if let Verification::Mismatch { local } =
                    st.run_crc.verify(record.scn, record.log, now)
                {
                    tracing::warn!(
                        shard = self.id,
                        scn = record.scn,
                        local = format_args!("{:#010x}", local),
                        "replica diverged from its source"
                    );
                    st.last_error = Some(ErrorClass::Divergence);
                }
                Ok(Applied::Meta)
            }
            TagKind::ShardAlter => {
                let op = ShardOp::decode(&row.data)?;
                tracing::info!(shard = self.id, shard_type = %op.shard_type, peers = ?op.peers, "shard altered");
                st.meta = op;
                Ok(Applied::Meta)
            }
            TagKind::ShardFinal => {
                tracing::info!(shard = self.id, "shard marked final");
                st.is_final = true;
                Ok(Applied::Meta)
            }
            _ if kind.is_consensus() => {
                if collect_consensus {
                    st.consensus_rows.push(row.clone());
                }
                Ok(Applied::Consensus)
            }
            _ => Ok(Applied::Meta),
        }
    }

    fn apply_data(&self, st: &mut ShardState, row: &Row) -> Result<Applied, ShardError> {
        if row.scn <= st.scn {
            tracing::debug!(shard = self.id, scn = row.scn, current = st.scn, "skipping applied row");
            return Ok(Applied::Duplicate);
        }
        if row.scn != st.scn + 1 {
            if self.panic_on_scn_gap {
                return Err(ShardError::ScnGap {
                    shard: self.id,
                    expected: st.scn + 1,
                    got: row.scn,
                });
            }
            tracing::warn!(shard = self.id, expected = st.scn + 1, got = row.scn, "scn gap");
        }
        st.executor.apply(&row.data, row.tag)?;
        st.scn = row.scn;
        st.reserved_scn = st.reserved_scn.max(row.scn);
        st.run_crc.update(row.scn, row.tag, &row.data);
        Ok(Applied::Data)
    }

    /// Consensus rows gathered during recovery, oldest first
    pub fn take_consensus_rows(&self) -> Vec<Row> {
        std::mem::take(&mut self.lock().consensus_rows)
    }

    /// A `run_crc` row declaring this shard's checksums at its current scn
    pub fn run_crc_row(&self, tm: f64) -> Row {
        let st = self.lock();
        let record = RunCrcRecord {
            scn: st.scn,
            log: st.run_crc.value(),
            module: st.executor.state_crc(),
        };
        Row::new(Tag::sys(TagKind::RunCrc), self.id, st.scn, record.encode())
            .with_aux(RowAux::run_crc(record.log))
            .with_tm(tm)
    }

    /// A heartbeat row so replicas can measure lag on an idle shard
    pub fn nop_row(&self, tm: f64) -> Row {
        let scn = self.scn();
        Row::new(Tag::sys(TagKind::Nop), self.id, scn, Bytes::new()).with_tm(tm)
    }

    pub fn run_crc_status(&self) -> RunCrcStatus {
        self.lock().run_crc.status()
    }

    /// Seconds since the run-CRC was last compared against a source
    pub fn run_crc_lag(&self, now: f64) -> Option<f64> {
        self.lock().run_crc.lag(now)
    }

    /// Copy everything a snapshot needs
    pub fn image(&self) -> ShardImage {
        // groups lock their own state before the shard's
        let group_rows = self.consensus().map(|c| c.snapshot_rows());
        let st = self.lock();
        let consensus_rows = match group_rows {
            Some(rows) => rows,
            None => st.consensus_rows.clone(),
        };
        ShardImage {
            id: self.id,
            meta: st.meta.clone(),
            scn: st.scn,
            is_final: st.is_final,
            run_crc: st.run_crc.value(),
            run_crc_mod: st.executor.state_crc(),
            executor: st.executor.box_clone(),
            consensus_rows,
        }
    }

    pub fn status(&self, now: f64) -> ShardStatus {
        let st = self.lock();
        ShardStatus {
            id: self.id,
            shard_type: st.meta.shard_type,
            scn: st.scn,
            lag: st.lag,
            run_crc: st.run_crc.status(),
            run_crc_lag: st.run_crc.lag(now),
            last_error: st.last_error,
            is_final: st.is_final,
        }
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Point-in-time copy of a shard for snapshotting
pub struct ShardImage {
    pub id: ShardId,
    pub meta: ShardOp,
    pub scn: Scn,
    pub is_final: bool,
    pub run_crc: u32,
    pub run_crc_mod: u32,
    pub executor: Box<dyn Executor>,
    /// Promises, votes and unapplied log entries, oldest first
    pub consensus_rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardStatus {
    pub id: ShardId,
    pub shard_type: ShardType,
    pub scn: Scn,
    pub lag: f64,
    pub run_crc: RunCrcStatus,
    pub run_crc_lag: Option<f64>,
    pub last_error: Option<ErrorClass>,
    pub is_final: bool,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard {} {} scn:{} lag:{:.3} run_crc:{} last_error:{}",
            self.id,
            self.shard_type,
            self.scn,
            self.lag,
            self.run_crc.as_str(),
            self.last_error.map(|c| c.as_str()).unwrap_or("none"),
        )?;
        if self.is_final {
            f.write_str(" final")?;
        }
        Ok(())
    }
}

/// Consensus for `por` shards: the local node alone orders writes
pub struct PrimaryConsensus<C: tl_core::Clock> {
    shard: Arc<Shard>,
    wal: WalWriter,
    clock: C,
}

impl<C: tl_core::Clock> PrimaryConsensus<C> {
    pub fn new(shard: Arc<Shard>, wal: WalWriter, clock: C) -> Self {
        Self { shard, wal, clock }
    }
}

#[async_trait]
impl<C: tl_core::Clock> ShardConsensus for PrimaryConsensus<C> {
    async fn submit(&self, tag: Tag, payload: Bytes) -> Result<Scn, ShardError> {
        let permit = self.wal.reserve().await?;
        let (scn, ticket) =
            self.shard
                .enqueue_data(&self.wal, permit, tag, payload, self.clock.wall())?;
        ticket.wait().await?;
        Ok(scn)
    }

    fn describe(&self) -> String {
        "primary".to_string()
    }
}

#[cfg(test)]
#[path = "shard_tests.rs"]
mod tests;
