// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-shard Paxos
//!
//! Each scn is decided by one instance of single-decree Paxos. The node
//! that submits a value proposes it for the scn after its shard's applied
//! position; if another value wins that scn the proposer applies the
//! winner and moves on to the next one.
//!
//! Promises and accepted values are logged as `paxos_promise` and
//! `paxos_accept` rows before the acceptor answers, and rebuilt from those
//! rows after recovery. A decided value becomes an ordinary data row.
//! Replicas that missed decisions fetch them from a peer's WAL; they never
//! run another round for an scn that is already decided.

mod msg;

pub use msg::{Accepted, Ballot, PaxosMsg};

use crate::context::Context;
use crate::error::{PaxosError, ShardError, WalError};
use crate::peer::{address, load_history, majority, Committer, Decided, PeerRouter};
use crate::shard::{Shard, ShardConsensus};
use async_trait::async_trait;
use bytes::Bytes;
use msg::{accept_row_data, decode_accept_row, decode_promise_row, promise_row_data};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tl_adapters::{FrameHandler, Transport};
use tl_core::{Clock, FormatError, Row, Scn, ShardId, ShardType, Tag, TagKind};
use tl_storage::LogDir;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct PaxosConfig {
    /// Per-peer call timeout
    pub call_timeout: Duration,
    /// Rounds tried for one scn before giving up
    pub max_attempts: u32,
    /// Base delay between rounds; grows with the attempt and is jittered
    pub retry_delay: Duration,
    /// Decided values per catch-up request
    pub fetch_batch: u32,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(1),
            max_attempts: 10,
            retry_delay: Duration::from_millis(20),
            fetch_batch: 256,
        }
    }
}

/// Counters for status output and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaxosStats {
    /// Scns this node decided as proposer
    pub decided: u64,
    /// Scns applied from a peer's history
    pub learned: u64,
    /// Rounds lost to a higher ballot
    pub conflicts: u64,
    pub round: u64,
}

/// The value this node drives to a decision at one scn
///
/// It takes over the highest value a quorum reports as accepted, so the
/// decision may not be the value first proposed.
#[derive(Debug, Clone)]
struct Proposal {
    scn: Scn,
    ballot: Ballot,
    tag: Tag,
    value: Bytes,
    /// A quorum accepted `value` at `ballot`, or a peer reported it decided
    applied: bool,
    /// The decided value is confirmed by the local WAL writer
    waled: bool,
}

impl Proposal {
    fn new(scn: Scn, tag: Tag, value: Bytes) -> Self {
        Self {
            scn,
            ballot: 0,
            tag,
            value,
            applied: false,
            waled: false,
        }
    }

    fn adopt(&mut self, tag: Tag, value: Bytes) {
        self.tag = tag;
        self.value = value;
    }

    fn decided(&self) -> Decided {
        Decided {
            scn: self.scn,
            tag: self.tag,
            value: self.value.clone(),
        }
    }
}

#[derive(Default)]
struct Acceptor {
    promised: BTreeMap<Scn, Ballot>,
    accepted: BTreeMap<Scn, Accepted>,
}

pub struct PaxosGroup<T: Transport, C: Clock> {
    name: String,
    index: u64,
    /// Every member except this node
    peers: Vec<String>,
    members: usize,
    transport: T,
    committer: Committer<C>,
    wal_dir: LogDir,
    config: PaxosConfig,
    acceptor: Mutex<Acceptor>,
    round: AtomicU64,
    /// One proposer per shard at a time
    proposer: tokio::sync::Mutex<()>,
    catching_up: AtomicBool,
    decided: AtomicU64,
    learned: AtomicU64,
    conflicts: AtomicU64,
    this: Weak<Self>,
}

impl<T: Transport, C: Clock> PaxosGroup<T, C> {
    /// Build the group for a recovered `paxos` shard, attach it to the
    /// shard and register it for peer frames
    pub fn start(
        ctx: &Context<C>,
        router: &PeerRouter,
        shard: ShardId,
        name: &str,
        transport: T,
        config: PaxosConfig,
    ) -> Result<Arc<Self>, ShardError> {
        let group = Self::new(ctx, shard, name, transport, config)?;
        ctx.attach(shard, Arc::clone(&group) as Arc<dyn ShardConsensus>)?;
        router.register(shard, Arc::clone(&group) as Arc<dyn FrameHandler>);
        Ok(group)
    }

    pub fn new(
        ctx: &Context<C>,
        shard: ShardId,
        name: &str,
        transport: T,
        config: PaxosConfig,
    ) -> Result<Arc<Self>, ShardError> {
        let shard = ctx.shard(shard).ok_or(ShardError::UnknownShard(shard))?;
        let wal = ctx.wal().ok_or(ShardError::Wal(WalError::Shutdown))?;
        let meta = shard.meta();
        if meta.shard_type != ShardType::Paxos {
            return Err(ShardError::Consensus(format!(
                "shard {} is {}, not paxos",
                shard.id(),
                meta.shard_type
            )));
        }
        let index = meta
            .peers
            .iter()
            .position(|p| p == name)
            .ok_or_else(|| {
                ShardError::Consensus(format!("{} is not a member of shard {}", name, shard.id()))
            })?;
        let acceptor = restore_acceptor(&shard)?;
        let peers = meta.peers.iter().filter(|p| *p != name).cloned().collect();
        let members = meta.peers.len();
        tracing::info!(
            shard = shard.id(),
            node = name,
            members,
            promised = acceptor.promised.len(),
            accepted = acceptor.accepted.len(),
            "paxos group started"
        );
        Ok(Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            index: index as u64,
            peers,
            members,
            transport,
            committer: Committer::new(shard, wal, ctx.clock().clone()),
            wal_dir: ctx.wal_dir().clone(),
            config,
            acceptor: Mutex::new(acceptor),
            round: AtomicU64::new(0),
            proposer: tokio::sync::Mutex::new(()),
            catching_up: AtomicBool::new(false),
            decided: AtomicU64::new(0),
            learned: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            this: this.clone(),
        }))
    }

    fn shard(&self) -> &Arc<Shard> {
        self.committer.shard()
    }

    pub fn stats(&self) -> PaxosStats {
        PaxosStats {
            decided: self.decided.load(Ordering::Relaxed),
            learned: self.learned.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            round: self.round.load(Ordering::Relaxed),
        }
    }

    fn lock_acceptor(&self) -> std::sync::MutexGuard<'_, Acceptor> {
        self.acceptor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide `value` for the next free scn and return that scn
    pub async fn propose(&self, tag: Tag, value: Bytes) -> Result<Scn, PaxosError> {
        let _turn = self.proposer.lock().await;
        loop {
            let mut proposal = Proposal::new(self.shard().scn() + 1, tag, value.clone());
            self.decide(&mut proposal).await?;
            debug_assert!(proposal.applied && proposal.waled);
            if proposal.tag == tag && proposal.value == value {
                return Ok(proposal.scn);
            }
            tracing::debug!(
                shard = self.shard().id(),
                scn = proposal.scn,
                ballot = proposal.ballot,
                "scn taken by another value"
            );
        }
    }

    /// Run rounds until `proposal.scn` is decided and stored locally
    async fn decide(&self, proposal: &mut Proposal) -> Result<(), PaxosError> {
        let scn = proposal.scn;
        let quorum = majority(self.members);
        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                self.pause(attempt).await;
            }
            proposal.ballot = self.next_ballot();
            let ballot = proposal.ballot;

            let mut promises = 0;
            let mut highest: Option<Accepted> = None;
            for reply in self.broadcast(PaxosMsg::Prepare { scn, ballot }).await {
                match reply {
                    PaxosMsg::Promise {
                        ballot: b,
                        accepted,
                        ..
                    } if b == ballot => {
                        promises += 1;
                        if let Some(a) = accepted {
                            if highest.as_ref().map_or(true, |h| a.ballot > h.ballot) {
                                highest = Some(a);
                            }
                        }
                    }
                    PaxosMsg::Nack { promised, .. } => self.observe(promised),
                    PaxosMsg::Decided(d) if d.scn == scn => return self.learn_into(proposal, d).await,
                    _ => {}
                }
            }
            if promises < quorum {
                tracing::debug!(scn, ballot, promises, attempt, "prepare lacked a quorum");
                continue;
            }

            if let Some(a) = highest {
                proposal.adopt(a.tag, a.value);
            }
            let accept = PaxosMsg::Accept {
                scn,
                ballot,
                tag: proposal.tag,
                value: proposal.value.clone(),
            };
            let mut accepts = 0;
            for reply in self.broadcast(accept).await {
                match reply {
                    PaxosMsg::Accepted { ballot: b, .. } if b == ballot => accepts += 1,
                    PaxosMsg::Nack { promised, .. } => self.observe(promised),
                    PaxosMsg::Decided(d) if d.scn == scn => return self.learn_into(proposal, d).await,
                    _ => {}
                }
            }
            if accepts < quorum {
                tracing::debug!(scn, ballot, accepts, attempt, "accept lacked a quorum");
                continue;
            }
            proposal.applied = true;

            let decided = proposal.decided();
            self.committer.commit(decided.clone()).await?;
            proposal.waled = true;
            self.forget_decided();
            self.decided.fetch_add(1, Ordering::Relaxed);
            self.send_commit(decided);
            return Ok(());
        }
        tracing::warn!(shard = self.shard().id(), scn, "no quorum");
        Err(PaxosError::NoQuorum {
            scn,
            attempts: self.config.max_attempts,
        })
    }

    /// Take a peer's decision for the proposal's scn
    async fn learn_into(&self, proposal: &mut Proposal, decided: Decided) -> Result<(), PaxosError> {
        proposal.adopt(decided.tag, decided.value.clone());
        proposal.applied = true;
        self.learn(decided).await?;
        proposal.waled = true;
        Ok(())
    }

    /// Apply a value a peer already decided, then pull whatever else it has
    async fn learn(&self, decided: Decided) -> Result<Decided, PaxosError> {
        self.committer.commit(decided.clone()).await?;
        self.forget_decided();
        self.learned.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.catch_up().await {
            tracing::debug!(shard = self.shard().id(), error = %e, "catch-up after learning failed");
        }
        Ok(decided)
    }

    fn next_ballot(&self) -> Ballot {
        let round = self.round.fetch_add(1, Ordering::Relaxed) + 1;
        round << 8 | self.index
    }

    fn observe(&self, promised: Ballot) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        self.round.fetch_max(promised >> 8, Ordering::Relaxed);
    }

    async fn pause(&self, attempt: u32) {
        let base = self.config.retry_delay.saturating_mul(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base.as_micros() as u64);
        tokio::time::sleep(base + Duration::from_micros(jitter)).await;
    }

    /// Ask this node and every peer; failed calls are left out
    async fn broadcast(&self, msg: PaxosMsg) -> Vec<PaxosMsg> {
        let frame = address(self.shard().id(), &msg.encode());
        let mut calls = JoinSet::new();
        for peer in &self.peers {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let frame = frame.clone();
            let timeout = self.config.call_timeout;
            calls.spawn(async move {
                let reply = tokio::time::timeout(timeout, transport.call(&peer, frame)).await;
                (peer, reply)
            });
        }

        let mut replies = Vec::with_capacity(self.members);
        match self.handle_msg(msg).await {
            Ok(reply) => replies.push(reply),
            Err(e) => tracing::warn!(node = %self.name, error = %e, "local acceptor failed"),
        }
        while let Some(joined) = calls.join_next().await {
            let Ok((peer, reply)) = joined else {
                continue;
            };
            match reply {
                Ok(Ok(frame)) => match PaxosMsg::decode(frame) {
                    Ok(reply) => replies.push(reply),
                    Err(e) => tracing::warn!(peer, error = %e, "bad paxos reply"),
                },
                Ok(Err(e)) => tracing::debug!(peer, error = %e, "paxos call failed"),
                Err(_) => tracing::debug!(peer, "paxos call timed out"),
            }
        }
        replies
    }

    /// Tell peers about a decision without waiting for them
    fn send_commit(&self, decided: Decided) {
        let frame = address(self.shard().id(), &PaxosMsg::Commit(decided).encode());
        for peer in &self.peers {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let frame = frame.clone();
            let timeout = self.config.call_timeout;
            tokio::spawn(async move {
                if let Ok(Err(e)) = tokio::time::timeout(timeout, transport.call(&peer, frame)).await {
                    tracing::debug!(peer, error = %e, "commit not delivered");
                }
            });
        }
    }

    /// Fetch decided values from peers until none has more; returns how
    /// many scns were applied
    pub async fn catch_up(&self) -> Result<u64, PaxosError> {
        if self.catching_up.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let start = self.shard().scn();
        let result = self.fetch_from_peers().await;
        self.catching_up.store(false, Ordering::Release);
        result?;
        let applied = (self.shard().scn() - start).max(0) as u64;
        if applied > 0 {
            self.learned.fetch_add(applied, Ordering::Relaxed);
            tracing::info!(shard = self.shard().id(), from = start + 1, applied, "caught up");
        }
        Ok(applied)
    }

    async fn fetch_from_peers(&self) -> Result<(), PaxosError> {
        for peer in &self.peers {
            loop {
                let fetch = PaxosMsg::Fetch {
                    from: self.shard().scn() + 1,
                    max: self.config.fetch_batch,
                };
                let frame = address(self.shard().id(), &fetch.encode());
                let reply =
                    tokio::time::timeout(self.config.call_timeout, self.transport.call(peer, frame))
                        .await;
                let entries = match reply {
                    Ok(Ok(frame)) => match PaxosMsg::decode(frame)? {
                        PaxosMsg::History(entries) => entries,
                        _ => break,
                    },
                    Ok(Err(e)) => {
                        tracing::debug!(peer, error = %e, "history fetch failed");
                        break;
                    }
                    Err(_) => break,
                };
                if entries.is_empty() {
                    break;
                }
                for decided in entries {
                    self.committer.commit(decided).await?;
                }
                self.forget_decided();
            }
        }
        Ok(())
    }

    fn spawn_catch_up(&self) {
        if self.catching_up.load(Ordering::Acquire) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.catch_up().await {
                tracing::warn!(shard = this.shard().id(), error = %e, "catch-up failed");
            }
        });
    }

    /// Drop acceptor state at or below the applied scn
    fn forget_decided(&self) {
        let applied = self.shard().scn();
        let mut acceptor = self.lock_acceptor();
        acceptor.promised.retain(|scn, _| *scn > applied);
        acceptor.accepted.retain(|scn, _| *scn > applied);
    }

    /// Answer one peer message
    pub async fn handle_msg(&self, msg: PaxosMsg) -> Result<PaxosMsg, PaxosError> {
        match msg {
            PaxosMsg::Prepare { scn, ballot } => self.on_prepare(scn, ballot).await,
            PaxosMsg::Accept {
                scn,
                ballot,
                tag,
                value,
            } => self.on_accept(scn, Accepted { ballot, tag, value }).await,
            PaxosMsg::Commit(decided) => {
                let gap = self.committer.commit(decided).await?;
                self.forget_decided();
                if gap {
                    self.spawn_catch_up();
                }
                Ok(PaxosMsg::Ack {
                    scn: self.shard().scn(),
                })
            }
            PaxosMsg::Fetch { from, max } => {
                let max = max.min(self.config.fetch_batch) as usize;
                let history = load_history(self.wal_dir.clone(), self.shard().id(), from, max).await?;
                Ok(PaxosMsg::History(history))
            }
            other => Err(PaxosError::Decode(FormatError::BadPayload(format!(
                "unexpected request {:?}",
                other
            )))),
        }
    }

    async fn on_prepare(&self, scn: Scn, ballot: Ballot) -> Result<PaxosMsg, PaxosError> {
        let applied = self.shard().scn();
        if scn <= applied {
            return self.decided_value(scn).await;
        }
        if scn > applied + 1 {
            self.spawn_catch_up();
        }
        let wal = self.committer.wal();
        let permit = wal.reserve().await?;
        let (ticket, accepted) = {
            let mut acceptor = self.lock_acceptor();
            let promised = acceptor.promised.get(&scn).copied().unwrap_or(0);
            if ballot <= promised {
                return Ok(PaxosMsg::Nack { scn, promised });
            }
            acceptor.promised.insert(scn, ballot);
            let row = self.sys_row(TagKind::PaxosPromise, scn, promise_row_data(ballot));
            let ticket = self.shard().enqueue_row(wal, permit, row)?;
            (ticket, acceptor.accepted.get(&scn).cloned())
        };
        ticket.wait().await?;
        Ok(PaxosMsg::Promise {
            scn,
            ballot,
            accepted,
        })
    }

    async fn on_accept(&self, scn: Scn, accepted: Accepted) -> Result<PaxosMsg, PaxosError> {
        if scn <= self.shard().scn() {
            return self.decided_value(scn).await;
        }
        let wal = self.committer.wal();
        let permit = wal.reserve().await?;
        let ballot = accepted.ballot;
        let ticket = {
            let mut acceptor = self.lock_acceptor();
            let promised = acceptor.promised.get(&scn).copied().unwrap_or(0);
            if ballot < promised {
                return Ok(PaxosMsg::Nack { scn, promised });
            }
            let row = self.sys_row(TagKind::PaxosAccept, scn, accept_row_data(&accepted));
            let ticket = self.shard().enqueue_row(wal, permit, row)?;
            acceptor.promised.insert(scn, ballot);
            acceptor.accepted.insert(scn, accepted);
            ticket
        };
        ticket.wait().await?;
        Ok(PaxosMsg::Accepted { scn, ballot })
    }

    async fn decided_value(&self, scn: Scn) -> Result<PaxosMsg, PaxosError> {
        let mut history = load_history(self.wal_dir.clone(), self.shard().id(), scn, 1).await?;
        match history.pop() {
            Some(decided) if decided.scn == scn => Ok(PaxosMsg::Decided(decided)),
            _ => Err(PaxosError::Shard(ShardError::Storage(format!(
                "decided value for scn {} not found in the wal",
                scn
            )))),
        }
    }

    fn sys_row(&self, kind: TagKind, scn: Scn, data: Bytes) -> Row {
        Row::new(Tag::sys(kind), self.shard().id(), scn, data).with_tm(self.committer.clock().wall())
    }
}

/// Rebuild promises and accepted values logged after the applied scn
fn restore_acceptor(shard: &Shard) -> Result<Acceptor, ShardError> {
    let applied = shard.scn();
    let mut acceptor = Acceptor::default();
    for row in shard.take_consensus_rows() {
        if row.scn <= applied {
            continue;
        }
        match row.tag.kind() {
            TagKind::PaxosPromise => {
                let ballot = decode_promise_row(row.data)?;
                let promised = acceptor.promised.entry(row.scn).or_default();
                *promised = (*promised).max(ballot);
            }
            TagKind::PaxosAccept => {
                let accepted = decode_accept_row(row.data)?;
                let promised = acceptor.promised.entry(row.scn).or_default();
                *promised = (*promised).max(accepted.ballot);
                acceptor.accepted.insert(row.scn, accepted);
            }
            _ => {}
        }
    }
    Ok(acceptor)
}

#[async_trait]
impl<T: Transport, C: Clock> ShardConsensus for PaxosGroup<T, C> {
    async fn submit(&self, tag: Tag, payload: Bytes) -> Result<Scn, ShardError> {
        self.propose(tag, payload).await.map_err(|e| match e {
            PaxosError::Shard(e) => e,
            PaxosError::Wal(e) => ShardError::Wal(e),
            other => ShardError::Consensus(other.to_string()),
        })
    }

    /// Promises and accepted values for every undecided scn
    fn snapshot_rows(&self) -> Vec<Row> {
        let acceptor = self.lock_acceptor();
        let mut rows = Vec::new();
        for (&scn, &promised) in &acceptor.promised {
            let accepted = acceptor.accepted.get(&scn);
            if let Some(accepted) = accepted {
                rows.push(self.sys_row(TagKind::PaxosAccept, scn, accept_row_data(accepted)));
            }
            if accepted.map_or(true, |a| promised > a.ballot) {
                rows.push(self.sys_row(TagKind::PaxosPromise, scn, promise_row_data(promised)));
            }
        }
        rows
    }

    fn describe(&self) -> String {
        format!(
            "paxos {} round:{}",
            self.name,
            self.round.load(Ordering::Relaxed)
        )
    }
}

#[async_trait]
impl<T: Transport, C: Clock> FrameHandler for PaxosGroup<T, C> {
    async fn handle(&self, frame: Bytes) -> Result<Bytes, String> {
        let msg = PaxosMsg::decode(frame).map_err(|e| e.to_string())?;
        self.handle_msg(msg)
            .await
            .map(|reply| reply.encode())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
