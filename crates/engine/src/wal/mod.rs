// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WAL writer pipeline
//!
//! Engine side of the durability worker. Callers build a [`Pack`] of rows,
//! [`WalWriter::enqueue`] it (assigning lsns in submission order) and await
//! the returned [`WalTicket`]. Replies are matched by `(epoch, seq)`; when
//! the worker dies the supervisor starts a new one under the next epoch
//! and resends every unacknowledged pack. Confirmed rows are handed to a
//! [`ConfirmSink`] in lsn order before their submitter wakes.

mod worker;

use crate::error::WalError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tl_core::{Lsn, Row, WalReply, WalRequest};
use tl_storage::LogDir;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use worker::{WalWorker, WorkerEvent, WorkerMsg};

/// Most rows one pack may carry
pub const MAX_PACK_ROWS: usize = 1024;

/// Crash the worker after it fsyncs a given pack but before it replies
#[derive(Debug, Clone)]
pub struct Fault {
    after_packs: u64,
    remaining: Arc<AtomicU32>,
}

impl Fault {
    /// Fire once, when a worker has written `after_packs` packs
    pub fn crash_after(after_packs: u64) -> Self {
        Self {
            after_packs,
            remaining: Arc::new(AtomicU32::new(1)),
        }
    }

    fn fire(&self, packs: u64) -> bool {
        packs >= self.after_packs
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }

    pub fn fired(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) == 0
    }
}

#[derive(Debug, Clone)]
pub struct WalWriterConfig {
    /// Rotate to a new file after this many rows
    pub rows_per_file: usize,
    /// How long the worker gathers packs before one fsync
    pub fsync_delay: Duration,
    /// Packs in flight before submitters wait
    pub inbox_size: usize,
    /// Consecutive worker restarts before the writer gives up
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub fault: Option<Fault>,
}

impl Default for WalWriterConfig {
    fn default() -> Self {
        Self {
            rows_per_file: 50_000,
            fsync_delay: Duration::ZERO,
            inbox_size: 128,
            max_restarts: 16,
            restart_delay: Duration::from_millis(10),
            fault: None,
        }
    }
}

/// Receives confirmed rows, in lsn order, before their submitters wake
pub trait ConfirmSink: Send + Sync + 'static {
    fn confirmed(&self, rows: &[Row]) -> Result<(), String>;
}

/// Sink that ignores confirmations
pub struct NullSink;

impl ConfirmSink for NullSink {
    fn confirmed(&self, _rows: &[Row]) -> Result<(), String> {
        Ok(())
    }
}

/// A batch of rows confirmed together
#[derive(Debug, Clone, Default)]
pub struct Pack {
    rows: Vec<Row>,
}

impl Pack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(row: Row) -> Self {
        Self { rows: vec![row] }
    }

    pub fn push(&mut self, row: Row) -> Result<(), WalError> {
        if self.rows.len() >= MAX_PACK_ROWS {
            return Err(WalError::PackFull(MAX_PACK_ROWS));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

/// Slot in the writer inbox, taken before a pack is enqueued
pub struct InboxPermit(OwnedSemaphorePermit);

/// Awaitable acknowledgment for one enqueued pack
pub struct WalTicket {
    seq: i64,
    first_lsn: Lsn,
    rx: oneshot::Receiver<Result<WalReply, WalError>>,
}

impl WalTicket {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Lsn assigned to the first row of the pack
    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    pub async fn wait(self) -> Result<WalReply, WalError> {
        self.rx.await.unwrap_or(Err(WalError::Shutdown))
    }
}

struct Pending {
    rows: Vec<Row>,
    reply: oneshot::Sender<Result<WalReply, WalError>>,
    _permit: OwnedSemaphorePermit,
}

struct WriterState {
    epoch: i64,
    seq: i64,
    next_lsn: Lsn,
    confirmed_lsn: Lsn,
    pending: BTreeMap<i64, Pending>,
    worker: Option<mpsc::Sender<WorkerMsg>>,
    closed: bool,
    restarts: u32,
}

struct Inner {
    dir: LogDir,
    config: WalWriterConfig,
    sink: Arc<dyn ConfirmSink>,
    inbox: Arc<Semaphore>,
    state: Mutex<WriterState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the WAL writer; clones share one pipeline
#[derive(Clone)]
pub struct WalWriter {
    inner: Arc<Inner>,
}

impl WalWriter {
    /// Open the WAL directory, start the worker thread and the supervisor
    ///
    /// `start_lsn` is the last lsn already covered by recovery. Must be
    /// called from within a tokio runtime.
    pub fn start(
        dir: LogDir,
        config: WalWriterConfig,
        start_lsn: Lsn,
        sink: Arc<dyn ConfirmSink>,
    ) -> Result<Self, tl_storage::LogError> {
        let worker = WalWorker::open(dir.clone(), &config, start_lsn)?;
        let durable = worker.durable();
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::channel();

        let inner = Arc::new(Inner {
            inbox: Arc::new(Semaphore::new(config.inbox_size.max(1))),
            dir,
            config,
            sink,
            state: Mutex::new(WriterState {
                epoch: 1,
                seq: 0,
                next_lsn: durable + 1,
                confirmed_lsn: durable,
                pending: BTreeMap::new(),
                worker: Some(inbox_tx),
                closed: false,
                restarts: 0,
            }),
            supervisor: Mutex::new(None),
        });

        spawn_worker(Ok(worker), inbox_rx, events_tx.clone(), 1);
        let handle = tokio::spawn(supervise(Arc::clone(&inner), events_rx, events_tx));
        *inner.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!(next_lsn = durable + 1, "wal writer started");
        Ok(Self { inner })
    }

    pub fn pack_prepare(&self) -> Pack {
        Pack::new()
    }

    pub fn pack_append_row(&self, pack: &mut Pack, row: Row) -> Result<(), WalError> {
        pack.push(row)
    }

    /// Wait for room in the inbox
    pub async fn reserve(&self) -> Result<InboxPermit, WalError> {
        Arc::clone(&self.inner.inbox)
            .acquire_owned()
            .await
            .map(InboxPermit)
            .map_err(|_| WalError::Shutdown)
    }

    /// Assign lsns and hand the pack to the worker
    ///
    /// Lsn order equals enqueue order, so callers that need rows of one
    /// shard in scn order enqueue under the shard's lock.
    pub fn enqueue(&self, permit: InboxPermit, pack: Pack) -> Result<WalTicket, WalError> {
        let mut rows = pack.rows;
        for row in &rows {
            row.check_len()?;
        }
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        if state.closed {
            return Err(WalError::Shutdown);
        }
        let first_lsn = state.next_lsn;
        for row in rows.iter_mut() {
            row.lsn = state.next_lsn;
            state.next_lsn += 1;
        }
        state.seq += 1;
        let seq = state.seq;
        let frame = WalRequest {
            seq,
            epoch: state.epoch,
            rows: rows.clone(),
        }
        .encode()?;
        if let Some(worker) = &state.worker {
            // A dead worker's channel is replaced on restart, which
            // resends everything still pending.
            let _ = worker.send(WorkerMsg::Request(frame));
        }
        state.pending.insert(
            seq,
            Pending {
                rows,
                reply: tx,
                _permit: permit.0,
            },
        );
        Ok(WalTicket { seq, first_lsn, rx })
    }

    /// Enqueue and wait for the acknowledgment
    pub async fn submit(&self, pack: Pack) -> Result<WalReply, WalError> {
        if pack.is_empty() {
            return Ok(WalReply {
                row_count: 0,
                seq: 0,
                epoch: self.epoch(),
                lsn: self.confirmed_lsn(),
            });
        }
        let permit = self.reserve().await?;
        self.enqueue(permit, pack)?.wait().await
    }

    /// Highest lsn acknowledged to a submitter
    pub fn confirmed_lsn(&self) -> Lsn {
        self.inner.lock().confirmed_lsn
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn epoch(&self) -> i64 {
        self.inner.lock().epoch
    }

    pub fn restarts(&self) -> u32 {
        self.inner.lock().restarts
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Stop accepting packs, let the worker seal its file and exit
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(worker) = state.worker.take() {
                let _ = worker.send(WorkerMsg::Shutdown);
            }
        }
        self.inner.inbox.close();
        let handle = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, epoch: i64, frame: &[u8]) {
        let reply = match WalReply::decode(frame) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "undecodable wal reply");
                return;
            }
        };
        let pending = {
            let mut state = self.lock();
            if epoch != state.epoch || reply.epoch != state.epoch {
                tracing::debug!(epoch, seq = reply.seq, "discarding stale reply");
                return;
            }
            let Some(pending) = state.pending.remove(&reply.seq) else {
                tracing::debug!(seq = reply.seq, "reply for unknown pack");
                return;
            };
            state.restarts = 0;
            if reply.row_count as usize == pending.rows.len() {
                state.confirmed_lsn = state.confirmed_lsn.max(reply.lsn);
            }
            pending
        };

        let written = (reply.row_count as usize).min(pending.rows.len());
        let applied = self.sink.confirmed(&pending.rows[..written]);
        let outcome = if written < pending.rows.len() {
            Err(WalError::WriteFailed {
                seq: reply.seq,
                written: reply.row_count,
                expected: pending.rows.len(),
            })
        } else {
            applied.map(|()| reply).map_err(WalError::Apply)
        };
        let _ = pending.reply.send(outcome);
    }

    /// Returns false once the supervisor should stop
    async fn on_exit(
        &self,
        epoch: i64,
        error: Option<String>,
        events: &tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
    ) -> bool {
        let (delay, new_epoch, inbox_rx, start_lsn) = {
            let mut state = self.lock();
            if epoch != state.epoch {
                return true;
            }
            if state.closed {
                fail_pending(&mut state, WalError::Shutdown);
                return false;
            }
            let reason = error.unwrap_or_else(|| "worker exited".to_string());
            state.restarts += 1;
            if state.restarts > self.config.max_restarts {
                tracing::error!(restarts = state.restarts, %reason, "wal writer giving up");
                state.closed = true;
                state.worker = None;
                fail_pending(&mut state, WalError::Worker(reason));
                self.inbox.close();
                return false;
            }

            state.epoch += 1;
            let (tx, rx) = mpsc::channel();
            for (seq, pending) in &state.pending {
                let request = WalRequest {
                    seq: *seq,
                    epoch: state.epoch,
                    rows: pending.rows.clone(),
                };
                // sizes were checked on enqueue
                match request.encode() {
                    Ok(frame) => {
                        let _ = tx.send(WorkerMsg::Request(frame));
                    }
                    Err(e) => tracing::error!(seq = *seq, error = %e, "pending pack not resent"),
                }
            }
            tracing::warn!(
                epoch = state.epoch,
                resubmitted = state.pending.len(),
                %reason,
                "restarting wal worker"
            );
            state.worker = Some(tx);
            (
                self.config.restart_delay * state.restarts,
                state.epoch,
                rx,
                state.confirmed_lsn,
            )
        };

        tokio::time::sleep(delay).await;
        let dir = self.dir.clone();
        let config = self.config.clone();
        let events = events.clone();
        spawn_worker_with(
            move || WalWorker::open(dir, &config, start_lsn),
            inbox_rx,
            events,
            new_epoch,
        );
        true
    }
}

fn fail_pending(state: &mut WriterState, error: WalError) {
    for (_, pending) in std::mem::take(&mut state.pending) {
        let _ = pending.reply.send(Err(error.clone()));
    }
}

fn spawn_worker(
    opened: Result<WalWorker, tl_storage::LogError>,
    inbox: mpsc::Receiver<WorkerMsg>,
    events: tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
    epoch: i64,
) {
    spawn_worker_with(move || opened, inbox, events, epoch);
}

fn spawn_worker_with<F>(
    open: F,
    inbox: mpsc::Receiver<WorkerMsg>,
    events: tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
    epoch: i64,
) where
    F: FnOnce() -> Result<WalWorker, tl_storage::LogError> + Send + 'static,
{
    let spawned = std::thread::Builder::new()
        .name(format!("wal-worker-{}", epoch))
        .spawn({
            let events = events.clone();
            move || worker::run_thread(open(), inbox, events, epoch)
        });
    if let Err(e) = spawned {
        let _ = events.send(WorkerEvent::Exited {
            epoch,
            error: Some(format!("spawn failed: {}", e)),
        });
    }
}

async fn supervise(
    inner: Arc<Inner>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<WorkerEvent>,
    events_tx: tokio::sync::mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Reply { epoch, frame } => inner.dispatch(epoch, &frame),
            WorkerEvent::Exited { epoch, error } => {
                if !inner.on_exit(epoch, error, &events_tx).await {
                    break;
                }
            }
        }
    }
    tracing::debug!("wal supervisor stopped");
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
