// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tempfile::TempDir;
use tl_core::{Tag, TagKind};
use tl_storage::{FileKind, XlogReader};

fn data(scn: i64) -> Row {
    Row::new(Tag::wal(TagKind::WalData), 1, scn, format!("v{}", scn))
}

#[derive(Default)]
struct Collect(Mutex<Vec<i64>>);

impl ConfirmSink for Collect {
    fn confirmed(&self, rows: &[Row]) -> Result<(), String> {
        self.0
            .lock()
            .unwrap()
            .extend(rows.iter().map(|r| r.lsn));
        Ok(())
    }
}

fn lsns_on_disk(dir: &LogDir) -> Vec<i64> {
    let mut out = Vec::new();
    for file in dir.files().unwrap() {
        let reader = XlogReader::open(&file.path, FileKind::Xlog).unwrap();
        out.extend(reader.rows().unwrap().map(|r| r.unwrap().lsn));
    }
    out
}

#[tokio::test]
async fn submit_assigns_increasing_lsns() {
    let tmp = TempDir::new().unwrap();
    let dir = LogDir::wal(tmp.path()).unwrap();
    let sink = Arc::new(Collect::default());
    let wal = WalWriter::start(dir.clone(), WalWriterConfig::default(), 0, sink.clone()).unwrap();

    let mut pack = wal.pack_prepare();
    wal.pack_append_row(&mut pack, data(1)).unwrap();
    wal.pack_append_row(&mut pack, data(2)).unwrap();
    let first = wal.submit(pack).await.unwrap();
    let second = wal.submit(Pack::single(data(3))).await.unwrap();

    assert_eq!(first.row_count, 2);
    assert_eq!(first.lsn, 2);
    assert_eq!(second.lsn, 3);
    assert_eq!(wal.confirmed_lsn(), 3);
    assert_eq!(*sink.0.lock().unwrap(), vec![1, 2, 3]);

    wal.shutdown().await;
    assert_eq!(lsns_on_disk(&dir), vec![1, 2, 3]);
}

#[tokio::test]
async fn concurrent_submitters_confirm_in_lsn_order() {
    let tmp = TempDir::new().unwrap();
    let dir = LogDir::wal(tmp.path()).unwrap();
    let sink = Arc::new(Collect::default());
    let config = WalWriterConfig {
        fsync_delay: Duration::from_millis(2),
        ..WalWriterConfig::default()
    };
    let wal = WalWriter::start(dir.clone(), config, 0, sink.clone()).unwrap();

    let tasks: Vec<_> = (1..=20)
        .map(|i| {
            let wal = wal.clone();
            tokio::spawn(async move { wal.submit(Pack::single(data(i))).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let confirmed = sink.0.lock().unwrap().clone();
    assert_eq!(confirmed, (1..=20).collect::<Vec<_>>());
    wal.shutdown().await;
}

#[tokio::test]
async fn worker_crash_resubmits_under_new_epoch() {
    let tmp = TempDir::new().unwrap();
    let dir = LogDir::wal(tmp.path()).unwrap();
    let sink = Arc::new(Collect::default());
    let fault = Fault::crash_after(2);
    let config = WalWriterConfig {
        fault: Some(fault.clone()),
        restart_delay: Duration::from_millis(1),
        ..WalWriterConfig::default()
    };
    let wal = WalWriter::start(dir.clone(), config, 0, sink.clone()).unwrap();

    for i in 1..=5 {
        let reply = wal.submit(Pack::single(data(i))).await.unwrap();
        assert_eq!(reply.lsn, i);
    }

    assert!(fault.fired());
    assert_eq!(wal.epoch(), 2);
    assert_eq!(*sink.0.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    wal.shutdown().await;
    assert_eq!(lsns_on_disk(&dir), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn restarts_past_the_limit_fail_pending_packs() {
    let tmp = TempDir::new().unwrap();
    let dir = LogDir::wal(tmp.path()).unwrap();
    let wal = WalWriter::start(
        dir.clone(),
        WalWriterConfig {
            max_restarts: 0,
            fault: Some(Fault::crash_after(1)),
            ..WalWriterConfig::default()
        },
        0,
        Arc::new(NullSink),
    )
    .unwrap();

    let err = wal.submit(Pack::single(data(1))).await.unwrap_err();
    assert!(matches!(err, WalError::Worker(_)), "{err:?}");
    assert!(wal.is_closed());
    assert!(matches!(
        wal.submit(Pack::single(data(2))).await,
        Err(WalError::Shutdown)
    ));
}

#[tokio::test]
async fn start_continues_after_existing_rows() {
    let tmp = TempDir::new().unwrap();
    let dir = LogDir::wal(tmp.path()).unwrap();
    let wal = WalWriter::start(dir.clone(), WalWriterConfig::default(), 0, Arc::new(NullSink)).unwrap();
    wal.submit(Pack::single(data(1))).await.unwrap();
    wal.shutdown().await;

    let wal = WalWriter::start(dir.clone(), WalWriterConfig::default(), 0, Arc::new(NullSink)).unwrap();
    assert_eq!(wal.next_lsn(), 2);
    let reply = wal.submit(Pack::single(data(2))).await.unwrap();
    assert_eq!(reply.lsn, 2);
    wal.shutdown().await;
    assert_eq!(lsns_on_disk(&dir), vec![1, 2]);
}

#[test]
fn pack_rejects_rows_past_the_limit() {
    let mut pack = Pack::new();
    for i in 0..MAX_PACK_ROWS {
        pack.push(data(i as i64)).unwrap();
    }
    assert!(matches!(pack.push(data(0)), Err(WalError::PackFull(_))));
}
