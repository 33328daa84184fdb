// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-shard Raft
//!
//! Log entries are indexed by scn. An entry is logged as a `raft_append`
//! row when stored and becomes an ordinary data row once committed, so the
//! shard's applied scn is also the applied log index. Term and vote
//! changes are logged as `raft_vote` rows before any reply depends on
//! them. The term of the newest entry dropped from memory after a
//! history pull is kept in a `raft_commit` row, so the up-to-date check
//! survives a restart.
//!
//! The leader keeps only the newest applied entries in memory. A follower
//! that falls behind the oldest of them pulls the committed history from
//! the leader's WAL before normal replication resumes.

mod msg;

pub use msg::{Entry, RaftMsg, Term};

use crate::context::Context;
use crate::error::{RaftError, ShardError, WalError};
use crate::peer::{address, load_history, majority, Committer, Decided, PeerRouter};
use crate::shard::{Shard, ShardConsensus};
use crate::wal::Pack;
use async_trait::async_trait;
use bytes::Bytes;
use msg::{
    append_row_data, commit_row_data, decode_append_row, decode_commit_row, decode_vote_row,
    vote_row_data,
};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tl_adapters::{FrameHandler, Transport};
use tl_core::{Clock, FormatError, Row, Scn, ShardId, ShardType, Tag, TagKind};
use tl_storage::LogDir;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout; the upper is twice this
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub call_timeout: Duration,
    /// How long `submit` waits for its entry to commit
    pub commit_timeout: Duration,
    /// Applied entries the leader keeps for followers
    pub retain_entries: usize,
    /// Entries per append or pull
    pub batch_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(100),
            call_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_secs(5),
            retain_entries: 1024,
            batch_entries: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub role: Role,
    pub term: Term,
    pub leader: Option<String>,
    pub commit: Scn,
    pub last_index: Scn,
    /// History pulls this node made after falling behind a leader
    pub catch_ups: u64,
}

struct RaftState {
    role: Role,
    term: Term,
    voted_for: Option<String>,
    leader: Option<String>,
    /// Entries after `base_index`
    log: BTreeMap<Scn, Entry>,
    /// Newest entry no longer held in `log`
    base_index: Scn,
    base_term: Term,
    commit: Scn,
    next_index: HashMap<String, Scn>,
    match_index: HashMap<String, Scn>,
    deadline: Instant,
}

impl RaftState {
    fn last_index(&self) -> Scn {
        self.log.keys().next_back().copied().unwrap_or(self.base_index)
    }

    fn last_term(&self) -> Term {
        self.log.values().next_back().map_or(self.base_term, |e| e.term)
    }

    fn term_at(&self, index: Scn) -> Option<Term> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.log.get(&index).map(|e| e.term)
    }

    fn first_index(&self) -> Scn {
        self.base_index + 1
    }
}

pub struct RaftGroup<T: Transport, C: Clock> {
    name: String,
    peers: Vec<String>,
    members: usize,
    transport: T,
    committer: Committer<C>,
    wal_dir: LogDir,
    config: RaftConfig,
    state: Mutex<RaftState>,
    catching_up: AtomicBool,
    catch_ups: AtomicU64,
    this: Weak<Self>,
}

impl<T: Transport, C: Clock> RaftGroup<T, C> {
    /// Build the group for a recovered `raft` shard, attach it and
    /// register it for peer frames; call [`RaftGroup::spawn`] to start
    /// its timers
    pub fn start(
        ctx: &Context<C>,
        router: &PeerRouter,
        shard: ShardId,
        name: &str,
        transport: T,
        config: RaftConfig,
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
        config: RaftConfig,
    ) -> Result<Arc<Self>, ShardError> {
        let shard = ctx.shard(shard).ok_or(ShardError::UnknownShard(shard))?;
        let wal = ctx.wal().ok_or(ShardError::Wal(WalError::Shutdown))?;
        let meta = shard.meta();
        if meta.shard_type != ShardType::Raft {
            return Err(ShardError::Consensus(format!(
                "shard {} is {}, not raft",
                shard.id(),
                meta.shard_type
            )));
        }
        if !meta.peers.iter().any(|p| p == name) {
            return Err(ShardError::Consensus(format!(
                "{} is not a member of shard {}",
                name,
                shard.id()
            )));
        }
        let peers: Vec<String> = meta.peers.iter().filter(|p| *p != name).cloned().collect();
        let deadline = Instant::now() + election_delay(&config);
        let state = restore_state(&shard, deadline)?;
        tracing::info!(
            shard = shard.id(),
            node = name,
            term = state.term,
            last_index = state.last_index(),
            "raft group started"
        );
        Ok(Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            members: meta.peers.len(),
            peers,
            transport,
            committer: Committer::new(shard, wal, ctx.clock().clone()),
            wal_dir: ctx.wal_dir().clone(),
            config,
            state: Mutex::new(state),
            catching_up: AtomicBool::new(false),
            catch_ups: AtomicU64::new(0),
            this: this.clone(),
        }))
    }

    fn shard(&self) -> &Arc<Shard> {
        self.committer.shard()
    }

    fn lock(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.lock();
        RaftStatus {
            role: st.role,
            term: st.term,
            leader: st.leader.clone(),
            commit: st.commit,
            last_index: st.last_index(),
            catch_ups: self.catch_ups.load(Ordering::Relaxed),
        }
    }

    /// Run election and heartbeat timers until `stop` turns true
    pub fn spawn(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                let (role, deadline) = {
                    let st = this.lock();
                    (st.role, st.deadline)
                };
                let wake = match role {
                    Role::Leader => {
                        this.replicate_all().await;
                        Instant::now() + this.config.heartbeat_interval
                    }
                    _ if Instant::now() >= deadline => {
                        if let Err(e) = this.start_election().await {
                            tracing::warn!(node = %this.name, error = %e, "election failed");
                        }
                        continue;
                    }
                    _ => deadline.min(Instant::now() + this.config.heartbeat_interval),
                };
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    _ = stop.changed() => break,
                }
            }
        })
    }

    /// Run `f` under the state lock and log the rows it returns; the
    /// result is released only once they are durable
    async fn persist<R>(
        &self,
        f: impl FnOnce(&mut RaftState) -> (R, Vec<Row>),
    ) -> Result<R, RaftError> {
        let wal = self.committer.wal();
        let permit = wal.reserve().await?;
        let (result, ticket) = {
            let mut st = self.lock();
            let (result, rows) = f(&mut st);
            if rows.is_empty() {
                (result, None)
            } else {
                let mut pack = Pack::new();
                for row in rows {
                    pack.push(row)?;
                }
                (result, Some(wal.enqueue(permit, pack)?))
            }
        };
        if let Some(ticket) = ticket {
            ticket.wait().await?;
        }
        Ok(result)
    }

    fn vote_row(&self, st: &RaftState) -> Row {
        let data = vote_row_data(st.term, st.voted_for.as_deref());
        self.sys_row(TagKind::RaftVote, self.shard().scn(), data)
    }

    fn sys_row(&self, kind: TagKind, scn: Scn, data: Bytes) -> Row {
        Row::new(Tag::sys(kind), self.shard().id(), scn, data).with_tm(self.committer.clock().wall())
    }

    fn reset_deadline(&self, st: &mut RaftState) {
        st.deadline = Instant::now() + election_delay(&self.config);
    }

    async fn start_election(&self) -> Result<(), RaftError> {
        let request = self
            .persist(|st| {
                st.term += 1;
                st.role = Role::Candidate;
                st.voted_for = Some(self.name.clone());
                st.leader = None;
                self.reset_deadline(st);
                let request = RaftMsg::RequestVote {
                    term: st.term,
                    candidate: self.name.clone(),
                    last_index: st.last_index(),
                    last_term: st.last_term(),
                };
                (request, vec![self.vote_row(st)])
            })
            .await?;
        let RaftMsg::RequestVote { term, .. } = request else {
            return Ok(());
        };
        tracing::info!(shard = self.shard().id(), node = %self.name, term, "starting election");

        let mut votes = 1;
        for reply in self.broadcast(&request).await {
            if let RaftMsg::Vote { term: t, granted } = reply {
                if t > term {
                    self.observe_term(t).await?;
                    return Ok(());
                }
                if granted && t == term {
                    votes += 1;
                }
            }
        }
        if votes < majority(self.members) {
            tracing::debug!(node = %self.name, term, votes, "election lost");
            return Ok(());
        }
        let elected = {
            let mut st = self.lock();
            if st.term != term || st.role != Role::Candidate {
                false
            } else {
                st.role = Role::Leader;
                st.leader = Some(self.name.clone());
                let next = st.last_index() + 1;
                for peer in &self.peers {
                    st.next_index.insert(peer.clone(), next);
                    st.match_index.insert(peer.clone(), 0);
                }
                true
            }
        };
        if elected {
            tracing::info!(shard = self.shard().id(), node = %self.name, term, votes, "elected leader");
            self.replicate_all().await;
        }
        Ok(())
    }

    /// Adopt a newer term seen in a reply and step down
    async fn observe_term(&self, term: Term) -> Result<(), RaftError> {
        self.persist(|st| {
            if term <= st.term {
                return ((), Vec::new());
            }
            tracing::info!(node = %self.name, old = st.term, new = term, "newer term seen");
            st.term = term;
            st.voted_for = None;
            st.role = Role::Follower;
            st.leader = None;
            self.reset_deadline(st);
            ((), vec![self.vote_row(st)])
        })
        .await
    }

    async fn broadcast(&self, msg: &RaftMsg) -> Vec<RaftMsg> {
        let frame = address(self.shard().id(), &msg.encode());
        let mut calls = JoinSet::new();
        for peer in &self.peers {
            calls.spawn(call(
                self.transport.clone(),
                peer.clone(),
                frame.clone(),
                self.config.call_timeout,
            ));
        }
        let mut replies = Vec::with_capacity(self.peers.len());
        while let Some(joined) = calls.join_next().await {
            if let Ok((_, Some(reply))) = joined {
                replies.push(reply);
            }
        }
        replies
    }

    /// One round of appends to every follower, then commit what a
    /// majority stores
    async fn replicate_all(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut rounds = JoinSet::new();
        for peer in &self.peers {
            let this = Arc::clone(&this);
            let peer = peer.clone();
            rounds.spawn(async move { this.replicate_to(&peer).await });
        }
        while let Some(joined) = rounds.join_next().await {
            if let Ok(Err(e)) = joined {
                tracing::debug!(node = %self.name, error = %e, "replication round failed");
            }
        }
        self.advance_commit();
        if let Err(e) = self.apply_committed().await {
            tracing::warn!(node = %self.name, error = %e, "committed entries not applied");
        }
    }

    async fn replicate_to(&self, peer: &str) -> Result<(), RaftError> {
        let (request, sent_to) = {
            let st = self.lock();
            if st.role != Role::Leader {
                return Ok(());
            }
            let next = st.next_index.get(peer).copied().unwrap_or(st.last_index() + 1);
            let prev_index = next - 1;
            // entries the leader no longer holds come from a history pull
            let entries: Vec<Entry> = if next < st.first_index() {
                Vec::new()
            } else {
                st.log
                    .range(next..)
                    .take(self.config.batch_entries)
                    .map(|(_, e)| e.clone())
                    .collect()
            };
            let sent_to = prev_index + entries.len() as Scn;
            let request = RaftMsg::AppendEntries {
                term: st.term,
                leader: self.name.clone(),
                prev_index,
                prev_term: st.term_at(prev_index).unwrap_or(0),
                first_index: st.first_index(),
                commit: st.commit,
                entries,
            };
            (request, sent_to)
        };
        let RaftMsg::AppendEntries { term, prev_index, .. } = request else {
            return Ok(());
        };
        let frame = address(self.shard().id(), &request.encode());
        let (_, reply) = call(
            self.transport.clone(),
            peer.to_string(),
            frame,
            self.config.call_timeout,
        )
        .await;
        let Some(RaftMsg::Appended {
            term: t,
            success,
            last_index,
        }) = reply
        else {
            return Ok(());
        };
        if t > term {
            return self.observe_term(t).await;
        }
        let mut st = self.lock();
        if st.term != term || st.role != Role::Leader {
            return Ok(());
        }
        if success {
            let matched = st.match_index.entry(peer.to_string()).or_insert(0);
            *matched = (*matched).max(sent_to);
            let matched = *matched;
            // a follower past the trimmed prefix resumes at the held log
            let held = last_index.min(st.base_index) + 1;
            st.next_index.insert(peer.to_string(), (matched + 1).max(held));
        } else {
            let next = (last_index + 1).min(prev_index).max(1);
            st.next_index.insert(peer.to_string(), next);
        }
        Ok(())
    }

    /// Commit the newest entry of the current term a majority stores
    fn advance_commit(&self) {
        let mut st = self.lock();
        if st.role != Role::Leader {
            return;
        }
        let quorum = majority(self.members);
        let mut index = st.last_index();
        while index > st.commit {
            if st.term_at(index) == Some(st.term) {
                let stored = 1 + st.match_index.values().filter(|m| **m >= index).count();
                if stored >= quorum {
                    st.commit = index;
                    break;
                }
            }
            index -= 1;
        }
    }

    /// Apply committed entries in order, then trim old applied ones
    async fn apply_committed(&self) -> Result<(), RaftError> {
        loop {
            let next = self.shard().scn() + 1;
            let entry = {
                let st = self.lock();
                if next > st.commit {
                    None
                } else {
                    st.log.get(&next).cloned()
                }
            };
            let Some(entry) = entry else {
                break;
            };
            self.committer
                .commit(Decided {
                    scn: entry.index,
                    tag: entry.tag,
                    value: entry.value,
                })
                .await?;
        }
        let applied = self.shard().scn();
        let keep_from = applied - self.config.retain_entries as Scn;
        let mut st = self.lock();
        while let Some((&index, entry)) = st.log.first_key_value() {
            if index > keep_from {
                break;
            }
            let term = entry.term;
            st.log.pop_first();
            st.base_index = index;
            st.base_term = term;
        }
        Ok(())
    }

    /// Append a value as leader and wait until it is committed and applied
    pub async fn propose(&self, tag: Tag, value: Bytes) -> Result<Scn, RaftError> {
        let appended = self
            .persist(|st| {
                if st.role != Role::Leader {
                    return (
                        Err(RaftError::NotLeader {
                            leader: st.leader.clone(),
                        }),
                        Vec::new(),
                    );
                }
                let entry = Entry {
                    index: st.last_index() + 1,
                    term: st.term,
                    tag,
                    value,
                };
                let row = self.sys_row(TagKind::RaftAppend, entry.index, append_row_data(&entry));
                let appended = (entry.index, entry.term);
                st.log.insert(entry.index, entry);
                (Ok(appended), vec![row])
            })
            .await?;
        let (index, term) = appended?;

        let deadline = Instant::now() + self.config.commit_timeout;
        loop {
            {
                let st = self.lock();
                if st.term != term || st.role != Role::Leader {
                    return Err(RaftError::Deposed(index));
                }
            }
            if self.shard().scn() >= index {
                return Ok(index);
            }
            if Instant::now() >= deadline {
                return Err(RaftError::NoQuorum(index));
            }
            self.replicate_all().await;
            if self.shard().scn() < index {
                tokio::time::sleep(self.config.heartbeat_interval / 4).await;
            }
        }
    }

    /// Answer one peer message
    pub async fn handle_msg(&self, msg: RaftMsg) -> Result<RaftMsg, RaftError> {
        match msg {
            RaftMsg::RequestVote {
                term,
                candidate,
                last_index,
                last_term,
            } => self.on_request_vote(term, candidate, last_index, last_term).await,
            RaftMsg::AppendEntries {
                term,
                leader,
                prev_index,
                prev_term,
                first_index,
                commit,
                entries,
            } => {
                self.on_append(term, leader, prev_index, prev_term, first_index, commit, entries)
                    .await
            }
            RaftMsg::PullEntries { from, max } => {
                let max = (max as usize).min(self.config.batch_entries);
                let entries = load_history(self.wal_dir.clone(), self.shard().id(), from, max).await?;
                let last_term = match entries.last() {
                    Some(d) => self.lock().term_at(d.scn).unwrap_or(0),
                    None => 0,
                };
                Ok(RaftMsg::Entries { entries, last_term })
            }
            other => Err(RaftError::Decode(FormatError::BadPayload(format!(
                "unexpected request {:?}",
                other
            )))),
        }
    }

    async fn on_request_vote(
        &self,
        term: Term,
        candidate: String,
        last_index: Scn,
        last_term: Term,
    ) -> Result<RaftMsg, RaftError> {
        self.persist(|st| {
            let mut changed = false;
            if term > st.term {
                st.term = term;
                st.voted_for = None;
                st.role = Role::Follower;
                st.leader = None;
                changed = true;
            }
            let up_to_date = (last_term, last_index) >= (st.last_term(), st.last_index());
            let free = st.voted_for.as_deref().map_or(true, |v| v == candidate);
            let granted = term == st.term && up_to_date && free;
            if granted {
                st.voted_for = Some(candidate.clone());
                self.reset_deadline(st);
            }
            let rows = if changed || granted {
                vec![self.vote_row(st)]
            } else {
                Vec::new()
            };
            tracing::debug!(node = %self.name, term, %candidate, granted, "vote requested");
            (
                RaftMsg::Vote {
                    term: st.term,
                    granted,
                },
                rows,
            )
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_append(
        &self,
        term: Term,
        leader: String,
        prev_index: Scn,
        prev_term: Term,
        first_index: Scn,
        commit: Scn,
        entries: Vec<Entry>,
    ) -> Result<RaftMsg, RaftError> {
        let applied = self.shard().scn();
        let (reply, lagging) = self
            .persist(|st| {
                let mut rows = Vec::new();
                if term < st.term {
                    let reply = RaftMsg::Appended {
                        term: st.term,
                        success: false,
                        last_index: st.last_index(),
                    };
                    return ((reply, false), rows);
                }
                if term > st.term {
                    st.term = term;
                    st.voted_for = None;
                    rows.push(self.vote_row(st));
                }
                st.role = Role::Follower;
                st.leader = Some(leader.clone());
                self.reset_deadline(st);

                let settled = applied.max(st.base_index);
                let last = st.last_index();
                if last + 1 < first_index || prev_index > last {
                    let reply = RaftMsg::Appended {
                        term: st.term,
                        success: false,
                        last_index: last,
                    };
                    return ((reply, last + 1 < first_index), rows);
                }
                if prev_index > settled && st.term_at(prev_index) != Some(prev_term) {
                    // never committed here; the leader's log wins
                    st.log.split_off(&prev_index);
                    let reply = RaftMsg::Appended {
                        term: st.term,
                        success: false,
                        last_index: st.last_index(),
                    };
                    return ((reply, false), rows);
                }
                for entry in entries {
                    if entry.index <= settled {
                        continue;
                    }
                    match st.log.get(&entry.index) {
                        Some(existing) if existing.term == entry.term => continue,
                        Some(_) => {
                            st.log.split_off(&entry.index);
                        }
                        None => {}
                    }
                    let data = append_row_data(&entry);
                    rows.push(self.sys_row(TagKind::RaftAppend, entry.index, data));
                    st.log.insert(entry.index, entry);
                }
                let last = st.last_index();
                st.commit = st.commit.max(commit.min(last));
                let reply = RaftMsg::Appended {
                    term: st.term,
                    success: true,
                    last_index: last,
                };
                ((reply, false), rows)
            })
            .await?;
        if lagging {
            self.spawn_catch_up(leader);
        }
        self.apply_committed().await?;
        Ok(reply)
    }

    fn spawn_catch_up(&self, leader: String) {
        if self.catching_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            self.catching_up.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(async move {
            let result = this.pull_history(&leader).await;
            this.catching_up.store(false, Ordering::Release);
            if let Err(e) = result {
                tracing::warn!(node = %this.name, %leader, error = %e, "catch-up failed");
            }
        });
    }

    /// Apply committed history from `leader` until it has nothing newer
    async fn pull_history(&self, leader: &str) -> Result<(), RaftError> {
        let start = self.shard().scn();
        tracing::info!(shard = self.shard().id(), node = %self.name, %leader, from = start + 1, "catching up");
        self.catch_ups.fetch_add(1, Ordering::Relaxed);
        loop {
            let request = RaftMsg::PullEntries {
                from: self.shard().scn() + 1,
                max: self.config.batch_entries as u32,
            };
            let frame = address(self.shard().id(), &request.encode());
            let (_, reply) = call(
                self.transport.clone(),
                leader.to_string(),
                frame,
                self.config.call_timeout,
            )
            .await;
            let Some(RaftMsg::Entries { entries, last_term }) = reply else {
                break;
            };
            let Some(last) = entries.last().map(|d| d.scn) else {
                break;
            };
            for decided in entries {
                self.committer.commit(decided).await?;
            }
            let applied = self.shard().scn();
            self.persist(|st| {
                if applied < last || last <= st.base_index {
                    return ((), Vec::new());
                }
                st.log.retain(|index, _| *index > last);
                // terms never fall along the log
                let term = last_term.max(st.base_term);
                st.base_index = last;
                st.base_term = term;
                st.commit = st.commit.max(last);
                let marker = self.sys_row(TagKind::RaftCommit, last, commit_row_data(term));
                ((), vec![marker])
            })
            .await?;
        }
        tracing::info!(
            shard = self.shard().id(),
            node = %self.name,
            applied = self.shard().scn() - start,
            "caught up"
        );
        Ok(())
    }
}

/// Call one peer; failures are logged and reported as no reply
async fn call<T: Transport>(
    transport: T,
    peer: String,
    frame: Bytes,
    timeout: Duration,
) -> (String, Option<RaftMsg>) {
    let reply = match tokio::time::timeout(timeout, transport.call(&peer, frame)).await {
        Ok(Ok(frame)) => match RaftMsg::decode(frame) {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::warn!(%peer, error = %e, "bad raft reply");
                None
            }
        },
        Ok(Err(e)) => {
            tracing::debug!(%peer, error = %e, "raft call failed");
            None
        }
        Err(_) => {
            tracing::debug!(%peer, "raft call timed out");
            None
        }
    };
    (peer, reply)
}

fn election_delay(config: &RaftConfig) -> Duration {
    let base = config.election_timeout;
    let spread = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    base + Duration::from_millis(spread)
}

/// Rebuild term, vote and unapplied entries from logged consensus rows
fn restore_state(shard: &Shard, deadline: Instant) -> Result<RaftState, ShardError> {
    let applied = shard.scn();
    let mut st = RaftState {
        role: Role::Follower,
        term: 0,
        voted_for: None,
        leader: None,
        log: BTreeMap::new(),
        base_index: applied,
        base_term: 0,
        commit: applied,
        next_index: HashMap::new(),
        match_index: HashMap::new(),
        deadline,
    };
    let mut marked = BTreeMap::new();
    for row in shard.take_consensus_rows() {
        match row.tag.kind() {
            TagKind::RaftCommit => {
                marked.insert(row.scn, decode_commit_row(row.data)?);
            }
            TagKind::RaftVote => {
                let (term, voted_for) = decode_vote_row(row.data)?;
                if term >= st.term {
                    st.term = term;
                    st.voted_for = voted_for;
                }
            }
            TagKind::RaftAppend => {
                let entry = decode_append_row(row.scn, row.data)?;
                st.log.split_off(&entry.index);
                st.log.insert(entry.index, entry);
            }
            _ => {}
        }
    }
    if let Some(entry) = st.log.get(&applied) {
        st.base_term = entry.term;
    } else if let Some((_, &term)) = marked.range(..=applied).next_back() {
        st.base_term = term;
    }
    st.log.retain(|index, _| *index > applied);
    Ok(st)
}

#[async_trait]
impl<T: Transport, C: Clock> ShardConsensus for RaftGroup<T, C> {
    async fn submit(&self, tag: Tag, payload: Bytes) -> Result<Scn, ShardError> {
        self.propose(tag, payload).await.map_err(|e| match e {
            RaftError::NotLeader { leader } => ShardError::NotLeader {
                shard: self.shard().id(),
                leader,
            },
            RaftError::Shard(e) => e,
            RaftError::Wal(e) => ShardError::Wal(e),
            other => ShardError::Consensus(other.to_string()),
        })
    }

    /// Term and vote, the applied entry's term, then unapplied entries
    fn snapshot_rows(&self) -> Vec<Row> {
        let st = self.lock();
        let applied = self.shard().scn();
        let mut rows = vec![self.vote_row(&st)];
        let applied_term = st
            .term_at(applied)
            .or_else(|| st.log.range(..=applied).next_back().map(|(_, e)| e.term))
            .unwrap_or(st.base_term);
        rows.push(self.sys_row(TagKind::RaftCommit, applied, commit_row_data(applied_term)));
        for entry in st.log.range(applied + 1..).map(|(_, e)| e) {
            rows.push(self.sys_row(TagKind::RaftAppend, entry.index, append_row_data(entry)));
        }
        rows
    }

    fn describe(&self) -> String {
        let st = self.lock();
        format!(
            "raft {} term:{} leader:{}",
            st.role,
            st.term,
            st.leader.as_deref().unwrap_or("none")
        )
    }
}

#[async_trait]
impl<T: Transport, C: Clock> FrameHandler for RaftGroup<T, C> {
    async fn handle(&self, frame: Bytes) -> Result<Bytes, String> {
        let msg = RaftMsg::decode(frame).map_err(|e| e.to_string())?;
        self.handle_msg(msg)
            .await
            .map(|reply| reply.encode())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
