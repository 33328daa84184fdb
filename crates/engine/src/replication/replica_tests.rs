// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::context::ContextConfig;
use crate::replication::{frame_row, serve_feeder, ping, Feeder, FeederConfig};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tempfile::TempDir;
use tl_core::{FakeClock, HandshakeReply, KvOp, Row, ShardOp, ShardType, Tag, TagKind};
use tl_storage::LogDir;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;

fn context(tmp: &TempDir, name: &str) -> Context<FakeClock> {
    let wal = LogDir::wal(tmp.path().join(name).join("wal")).unwrap();
    let snap = LogDir::snap(tmp.path().join(name).join("snap")).unwrap();
    Context::new(FakeClock::new(), wal, snap, ContextConfig::default())
}

fn por() -> ShardOp {
    ShardOp::new(ShardType::Por, "tree", vec!["self".to_string()])
}

fn put(key: &str) -> Bytes {
    KvOp::put(key.to_string(), "v".to_string()).encode()
}

fn data(scn: i64) -> Row {
    Row::new(Tag::wal(TagKind::WalData), 1, scn, put(&format!("k{scn}"))).with_lsn(scn + 1)
}

fn config(addr: String) -> ReplicaConfig {
    ReplicaConfig {
        feeder_addr: addr,
        filter: None,
        connect_timeout: Duration::from_secs(1),
        min_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(50),
    }
}

async fn accept(mut server: DuplexStream) -> (DuplexStream, Handshake) {
    let mut raw = vec![0u8; tl_core::wire::HANDSHAKE_V1_LEN];
    server.read_exact(&mut raw).await.unwrap();
    loop {
        let more = Handshake::remaining_len(&raw).unwrap();
        if more == 0 {
            break;
        }
        let start = raw.len();
        raw.resize(start + more, 0);
        server.read_exact(&mut raw[start..]).await.unwrap();
    }
    server
        .write_all(&HandshakeReply::accept(Handshake::V2).encode())
        .await
        .unwrap();
    (server, Handshake::decode(&raw).unwrap())
}

async fn wait_for_scn(ctx: &Context<FakeClock>, shard: u16, scn: i64) {
    for _ in 0..400 {
        if ctx.shard(shard).map(|s| s.scn()) == Some(scn) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("shard {shard} never reached scn {scn}");
}

#[tokio::test]
async fn corrupt_row_is_not_applied() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp, "replica");
    let replica = Replica::new(ctx.clone(), config("feeder".into()));
    let (client, server) = duplex(1 << 16);

    let feeder = tokio::spawn(async move {
        let (mut server, hs) = accept(server).await;
        assert_eq!(hs.scn, 0);
        let mut buf = BytesMut::new();
        let create = Row::new(Tag::sys(TagKind::ShardCreate), 1, 0, por().encode().unwrap());
        frame_row(&mut buf, &create.with_lsn(1)).unwrap();
        frame_row(&mut buf, &data(1)).unwrap();
        frame_row(&mut buf, &ping(1.0)).unwrap();
        frame_row(&mut buf, &data(2)).unwrap();
        let start = buf.len();
        frame_row(&mut buf, &data(3)).unwrap();
        let last = buf.len() - 1;
        assert!(last > start);
        buf[last] ^= 0x01;
        server.write_all(&buf).await.unwrap();
        server
    });

    let err = replica.follow(client).await.unwrap_err();
    assert!(matches!(err, PullError::Format(_)), "{err:?}");
    assert!(!err.is_fatal());

    let shard = ctx.shard(1).unwrap();
    assert_eq!(shard.scn(), 2);
    assert!(shard.get(b"k3").is_none());
    assert!(shard.get(b"k2").is_some());
    drop(feeder.await.unwrap());
}

#[tokio::test]
async fn replica_resumes_from_its_lowest_scn() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp, "replica");
    let create = Row::new(Tag::sys(TagKind::ShardCreate), 1, 0, por().encode().unwrap());
    ctx.apply_remote(create).await.unwrap();
    ctx.apply_remote(data(1)).await.unwrap();
    ctx.apply_remote(data(2)).await.unwrap();

    let replica = Replica::new(ctx.clone(), config("feeder".into()));
    let (client, server) = duplex(1 << 16);
    let feeder = tokio::spawn(async move {
        let (server, hs) = accept(server).await;
        drop(server);
        hs
    });
    let err = replica.follow(client).await.unwrap_err();
    assert!(matches!(err, PullError::Closed), "{err:?}");
    assert_eq!(feeder.await.unwrap().scn, 2);
}

#[tokio::test]
async fn replica_follows_a_feeder_until_stopped() {
    let tmp = TempDir::new().unwrap();
    let primary = context(&tmp, "primary");
    primary.start_wal().unwrap();
    primary.create_shard(1, por()).await.unwrap();
    for i in 0..5 {
        primary
            .submit(1, Tag::wal(TagKind::WalData), put(&format!("k{i}")))
            .await
            .unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config_feed = FeederConfig {
        poll_interval: Duration::from_millis(5),
        ping_interval: Duration::from_millis(50),
        batch_rows: 4,
    };
    let feeder = Arc::new(Feeder::new(primary.wal_dir().clone(), config_feed, FakeClock::new()));
    let server = tokio::spawn(serve_feeder(listener, feeder));

    let ctx = context(&tmp, "replica");
    let replica = Arc::new(Replica::new(ctx.clone(), config(addr)));
    let mut status = replica.status();
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn({
        let replica = Arc::clone(&replica);
        async move { replica.run(stop_rx).await }
    });

    wait_for_scn(&ctx, 1, 5).await;
    assert!(matches!(*status.borrow_and_update(), ReplicaStatus::Connected { .. }));

    // rows written after the replica connected arrive too
    primary
        .submit(1, Tag::wal(TagKind::WalData), put("late"))
        .await
        .unwrap();
    wait_for_scn(&ctx, 1, 6).await;
    assert!(ctx.shard(1).unwrap().get(b"late").is_some());

    stop_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    assert_eq!(*status.borrow(), ReplicaStatus::Stopped);
    server.abort();
    primary.shutdown().await;
}

#[tokio::test]
async fn rejected_filter_stops_the_replica() {
    let tmp = TempDir::new().unwrap();
    let primary = context(&tmp, "primary");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let feeder = Arc::new(Feeder::new(
        primary.wal_dir().clone(),
        FeederConfig::default(),
        FakeClock::new(),
    ));
    let server = tokio::spawn(serve_feeder(listener, feeder));

    let mut config = config(addr);
    config.filter = Some(tl_core::FilterSpec::native("region"));
    let replica = Replica::new(context(&tmp, "replica"), config);
    let status = replica.status();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let err = replica.run(stop_rx).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        &*status.borrow(),
        ReplicaStatus::Failed { class: ErrorClass::Protocol, .. }
    ));
    server.abort();
}

#[tokio::test]
async fn unreachable_feeder_backs_off() {
    // bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let tmp = TempDir::new().unwrap();
    let replica = Arc::new(Replica::new(context(&tmp, "replica"), config(addr)));
    let mut status = replica.status();
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn({
        let replica = Arc::clone(&replica);
        async move { replica.run(stop_rx).await }
    });

    let attempt = loop {
        status.changed().await.unwrap();
        if let ReplicaStatus::Backoff { attempt, class, .. } = &*status.borrow_and_update() {
            assert_eq!(*class, ErrorClass::TransientIo);
            break *attempt;
        }
    };
    assert!(attempt >= 1);
    stop_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let min = Duration::from_millis(10);
    let max = Duration::from_millis(100);
    assert_eq!(backoff(min, max, 1), Duration::from_millis(10));
    assert_eq!(backoff(min, max, 2), Duration::from_millis(20));
    assert_eq!(backoff(min, max, 4), Duration::from_millis(80));
    assert_eq!(backoff(min, max, 5), max);
    assert_eq!(backoff(min, max, 60), max);
}
