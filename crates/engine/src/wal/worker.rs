// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durability worker
//!
//! Runs on its own OS thread. Receives encoded [`WalRequest`] frames,
//! appends their rows to the current WAL file, fsyncs, and answers with
//! encoded [`WalReply`] frames. A reply is never sent before the fsync
//! covering its rows has returned.

use super::{Fault, WalWriterConfig};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Instant;
use tl_core::{Lsn, Row, Scn, ShardId, Tag, TagKind, WalReply, WalRequest};
use tl_storage::{FileHeader, FileKind, LogDir, LogError, ReadEnd, XlogReader, XlogWriter};
use tokio::sync::mpsc::UnboundedSender;

/// Most request frames folded into one fsync
const MAX_BATCH: usize = 64;

pub(super) enum WorkerMsg {
    Request(Bytes),
    Shutdown,
}

#[derive(Debug)]
pub(super) enum WorkerEvent {
    Reply { epoch: i64, frame: Bytes },
    Exited { epoch: i64, error: Option<String> },
}

/// Sends `Exited` however the worker thread ends, panics included
struct ExitNotice {
    events: UnboundedSender<WorkerEvent>,
    epoch: i64,
    error: Option<String>,
    clean: bool,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let error = if self.clean {
            self.error.take()
        } else {
            Some("wal worker panicked".to_string())
        };
        let _ = self.events.send(WorkerEvent::Exited {
            epoch: self.epoch,
            error,
        });
    }
}

/// Thread entry point
pub(super) fn run_thread(
    opened: Result<WalWorker, LogError>,
    inbox: Receiver<WorkerMsg>,
    events: UnboundedSender<WorkerEvent>,
    epoch: i64,
) {
    let mut notice = ExitNotice {
        events: events.clone(),
        epoch,
        error: None,
        clean: false,
    };
    let result = match opened {
        Ok(worker) => worker.run(&inbox, &events, epoch),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = &result {
        tracing::error!(epoch, error = %e, "wal worker exited");
    }
    notice.error = result.err();
    notice.clean = true;
}

pub(super) struct WalWorker {
    dir: LogDir,
    rows_per_file: usize,
    fsync_delay: std::time::Duration,
    fault: Option<Fault>,
    writer: Option<XlogWriter>,
    /// Highest lsn known to be on disk
    durable: Lsn,
    /// Latest scn written per shard, for new file headers
    scns: BTreeMap<ShardId, Scn>,
    packs: u64,
}

impl WalWorker {
    /// Open the WAL directory and position after the last valid row
    ///
    /// An in-progress tail is reopened for appending; a torn final row is
    /// cut off. `start_lsn` is the lsn recovery already covers, used when
    /// the directory holds nothing newer.
    pub(super) fn open(
        dir: LogDir,
        config: &WalWriterConfig,
        start_lsn: Lsn,
    ) -> Result<Self, LogError> {
        let mut worker = Self {
            dir,
            rows_per_file: config.rows_per_file.max(1),
            fsync_delay: config.fsync_delay,
            fault: config.fault.clone(),
            writer: None,
            durable: start_lsn,
            scns: BTreeMap::new(),
            packs: 0,
        };

        let Some(last) = worker.dir.files()?.pop() else {
            return Ok(worker);
        };
        let reader = XlogReader::open(&last.path, FileKind::Xlog)?;
        worker.scns = reader.header().scns.clone();

        let mut rows = reader.rows()?;
        let mut count = 0usize;
        let mut last_lsn = None;
        for row in rows.by_ref() {
            let Ok(row) = row else {
                break;
            };
            worker.note_scn(&row);
            last_lsn = Some(row.lsn);
            count += 1;
        }
        let valid_end = rows.last_valid_position();
        if let ReadEnd::Broken { offset, error } = rows.end() {
            tracing::warn!(
                path = %last.path.display(),
                offset,
                %error,
                "wal tail is torn, appending after last valid row"
            );
        }

        worker.durable = worker
            .durable
            .max(last_lsn.unwrap_or(last.lsn - 1));
        if last.in_progress {
            worker.writer = Some(XlogWriter::reopen(
                &worker.dir,
                &last,
                valid_end,
                last_lsn,
                count,
            )?);
        }
        tracing::info!(durable = worker.durable, "wal worker opened");
        Ok(worker)
    }

    pub(super) fn durable(&self) -> Lsn {
        self.durable
    }

    fn note_scn(&mut self, row: &Row) {
        if row.tag.kind().is_data() || row.tag.kind().is_shard_op() {
            let scn = self.scns.entry(row.shard_id).or_insert(row.scn);
            *scn = (*scn).max(row.scn);
        }
    }

    fn run(
        mut self,
        inbox: &Receiver<WorkerMsg>,
        events: &UnboundedSender<WorkerEvent>,
        epoch: i64,
    ) -> Result<(), String> {
        loop {
            let (batch, stop) = self.collect(inbox);
            if !batch.is_empty() {
                let replies = self.write_batch(&batch).map_err(|e| e.to_string())?;
                self.packs += batch.len() as u64;
                if self.fault_fires() {
                    return Err(format!("injected fault after pack {}", self.packs));
                }
                for reply in replies {
                    let frame = WalReply { epoch, ..reply }.encode();
                    if events.send(WorkerEvent::Reply { epoch, frame }).is_err() {
                        return Ok(());
                    }
                }
            }
            if stop {
                return self.shutdown().map_err(|e| e.to_string());
            }
        }
    }

    /// Block for one request, then gather more until `fsync_delay` passes
    fn collect(&self, inbox: &Receiver<WorkerMsg>) -> (Vec<WalRequest>, bool) {
        let mut batch = Vec::new();
        match inbox.recv() {
            Ok(WorkerMsg::Request(frame)) => self.decode_into(&frame, &mut batch),
            Ok(WorkerMsg::Shutdown) | Err(_) => return (batch, true),
        }
        let deadline = Instant::now() + self.fsync_delay;
        while batch.len() < MAX_BATCH {
            let wait = deadline.saturating_duration_since(Instant::now());
            match inbox.recv_timeout(wait) {
                Ok(WorkerMsg::Request(frame)) => self.decode_into(&frame, &mut batch),
                Ok(WorkerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    return (batch, true)
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
        (batch, false)
    }

    fn decode_into(&self, frame: &[u8], batch: &mut Vec<WalRequest>) {
        match WalRequest::decode(frame) {
            Ok(req) => batch.push(req),
            Err(e) => tracing::error!(error = %e, "dropping undecodable wal request"),
        }
    }

    fn fault_fires(&self) -> bool {
        match &self.fault {
            Some(fault) => fault.fire(self.packs),
            None => false,
        }
    }

    /// Append every request, fsync once, and build the replies
    ///
    /// Any failure is returned without replies: the worker exits and the
    /// engine resubmits under a new epoch, skipping rows that did land.
    pub(super) fn write_batch(&mut self, batch: &[WalRequest]) -> Result<Vec<WalReply>, LogError> {
        let appended = batch.iter().try_for_each(|req| self.append_request(req));
        if let Some(writer) = self.writer.as_mut() {
            let confirmed = writer.confirm_write();
            if let Some(lsn) = writer.confirmed_lsn() {
                self.durable = self.durable.max(lsn);
            }
            confirmed?;
        }
        appended?;

        Ok(batch
            .iter()
            .map(|req| WalReply {
                row_count: req.rows.iter().filter(|r| r.lsn <= self.durable).count() as u32,
                seq: req.seq,
                epoch: req.epoch,
                lsn: self.durable,
            })
            .collect())
    }

    fn append_request(&mut self, req: &WalRequest) -> Result<(), LogError> {
        for row in &req.rows {
            let next = self.next_lsn();
            if row.lsn < next {
                // already durable from an earlier epoch
                continue;
            }
            for gap in next..row.lsn {
                let dummy = Row::new(Tag::sys(TagKind::WalFinal), 0, 0, Bytes::new())
                    .with_lsn(gap)
                    .with_tm(row.tm);
                self.append_row(&dummy)?;
            }
            if row.lsn > next {
                tracing::warn!(from = next, to = row.lsn - 1, "filled lsn gap with wal_final rows");
            }
            self.append_row(row)?;
        }
        Ok(())
    }

    fn next_lsn(&self) -> Lsn {
        match &self.writer {
            Some(w) => w.next_lsn(),
            None => self.durable + 1,
        }
    }

    fn append_row(&mut self, row: &Row) -> Result<(), LogError> {
        if self
            .writer
            .as_ref()
            .is_some_and(|w| w.rows() >= self.rows_per_file)
        {
            if let Some(full) = self.writer.take() {
                let next = full.next_lsn();
                full.close()?;
                self.durable = self.durable.max(next - 1);
            }
        }
        if self.writer.is_none() {
            let mut header = FileHeader::new(FileKind::Xlog);
            header.scns = self.scns.clone();
            self.writer = Some(XlogWriter::create(&self.dir, row.lsn, &header)?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.append(row)?;
        }
        self.note_scn(row);
        Ok(())
    }

    fn shutdown(mut self) -> Result<(), LogError> {
        if let Some(writer) = self.writer.take() {
            writer.close()?;
        }
        tracing::info!(durable = self.durable, "wal worker stopped");
        Ok(())
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
