// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::config::ShardConfig;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tl_core::{KvOp, Tag, TagKind};

fn shard(id: u16, shard_type: ShardType, peers: &[&str]) -> ShardConfig {
    ShardConfig {
        id,
        shard_type,
        module: "hash".to_string(),
        peers: peers.iter().map(|p| p.to_string()).collect(),
    }
}

fn config(dir: &Path) -> Config {
    Config {
        wal_dir: dir.join("wal"),
        snap_dir: dir.join("snap"),
        log_path: dir.join("tld.log"),
        run_crc_delay: Duration::ZERO,
        wal_dir_rescan_delay: Duration::from_millis(10),
        shards: vec![shard(1, ShardType::Por, &[])],
        ..Config::default()
    }
}

fn put(key: &str) -> Bytes {
    KvOp::put(key.to_string(), "v").encode()
}

async fn write(daemon: &Daemon, id: u16, key: &str) -> i64 {
    daemon
        .context()
        .submit(id, Tag::wal(TagKind::WalData), put(key))
        .await
        .unwrap()
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn primary_creates_shards_once_and_recovers_them() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let mut daemon = startup(&config).await.unwrap();
    assert!(!daemon.is_standby());
    daemon.serve().await.unwrap();
    assert_eq!(daemon.state(), RecoveryState::Primary);
    assert_eq!(write(&daemon, 1, "k1").await, 1);
    assert_eq!(write(&daemon, 1, "k2").await, 2);
    daemon.shutdown().await;

    let mut daemon = startup(&config).await.unwrap();
    let shard = daemon.context().shard(1).unwrap();
    assert_eq!(shard.scn(), 2);
    assert_eq!(shard.get(b"k1").as_deref(), Some(&b"v"[..]));
    daemon.serve().await.unwrap();
    assert_eq!(write(&daemon, 1, "k3").await, 3);
    daemon.shutdown().await;
}

#[tokio::test]
async fn second_daemon_on_the_same_directories_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let first = startup(&config).await.unwrap();
    let err = startup(&config).await.err().unwrap();
    assert!(
        matches!(err, LifecycleError::Log(LogError::Locked(_))),
        "{err}"
    );
    first.shutdown().await;

    // Released on shutdown
    let again = startup(&config).await.unwrap();
    again.shutdown().await;
}

#[tokio::test]
async fn corrupt_sealed_wal_file_stops_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        rows_per_wal: 2,
        ..config(dir.path())
    };

    let mut daemon = startup(&config).await.unwrap();
    daemon.serve().await.unwrap();
    for i in 1..=4 {
        write(&daemon, 1, &format!("k{i}")).await;
    }
    daemon.shutdown().await;

    let files = LogDir::wal(&config.wal_dir).unwrap().files().unwrap();
    assert!(files.len() >= 2, "{files:?}");
    let first = &files[0].path;
    let mut bytes = std::fs::read(first).unwrap();
    // Last row payload, just before the eof marker
    let at = bytes.len() - 6;
    bytes[at] ^= 0xff;
    std::fs::write(first, bytes).unwrap();

    let err = startup(&config).await.err().unwrap();
    assert!(matches!(err, LifecycleError::Recovery(_)), "{err}");
    assert_eq!(err.class(), ErrorClass::Format);
}

#[tokio::test]
async fn hot_standby_takes_over_when_the_primary_stops() {
    let dir = tempfile::tempdir().unwrap();
    let primary_config = config(dir.path());
    let standby_config = Config {
        hot_standby: true,
        ..config(dir.path())
    };

    let mut primary = startup(&primary_config).await.unwrap();
    primary.serve().await.unwrap();
    write(&primary, 1, "k1").await;

    let standby = startup(&standby_config).await.unwrap();
    assert!(standby.is_standby());
    let standby_ctx = standby.context().clone();
    let promoted = tokio::spawn(async move {
        let mut standby = standby;
        standby.serve().await.map(|_| standby)
    });

    write(&primary, 1, "k2").await;
    wait_for("standby to replay k2", || {
        standby_ctx.shard(1).is_some_and(|s| s.scn() == 2)
    })
    .await;
    assert!(!promoted.is_finished());

    primary.shutdown().await;
    let standby = tokio::time::timeout(Duration::from_secs(10), promoted)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!standby.is_standby());
    assert_eq!(standby.state(), RecoveryState::Primary);
    assert_eq!(write(&standby, 1, "k3").await, 3);
    standby.shutdown().await;
}

#[tokio::test]
async fn replica_follows_the_primary_feeder() {
    let primary_dir = tempfile::tempdir().unwrap();
    let replica_dir = tempfile::tempdir().unwrap();

    let mut primary = startup(&Config {
        wal_feeder_bind_addr: Some("127.0.0.1:0".to_string()),
        ..config(primary_dir.path())
    })
    .await
    .unwrap();
    primary.serve().await.unwrap();
    let feeder = primary.feeder_addr().unwrap();
    write(&primary, 1, "k1").await;

    let mut replica = startup(&Config {
        wal_feeder_addr: Some(feeder.to_string()),
        ..config(replica_dir.path())
    })
    .await
    .unwrap();
    replica.serve().await.unwrap();
    for i in 2..=3 {
        write(&primary, 1, &format!("k{i}")).await;
    }

    let ctx = replica.context().clone();
    wait_for("replica to reach scn 3", || {
        ctx.shard(1).is_some_and(|s| s.scn() == 3)
    })
    .await;
    assert_eq!(ctx.shard(1).unwrap().get(b"k3").as_deref(), Some(&b"v"[..]));
    assert!(matches!(
        replica.replica_status(),
        Some(ReplicaStatus::Connected { .. })
    ));
    // the feeder owns shard 1 here
    let local = ctx.submit(1, Tag::wal(TagKind::WalData), put("local")).await;
    assert!(matches!(local, Err(tl_engine::ShardError::Replica(1))), "{local:?}");

    replica.shutdown().await;
    primary.shutdown().await;

    // The replica stored what it received
    let replica = startup(&config(replica_dir.path())).await.unwrap();
    assert_eq!(replica.context().shard(1).unwrap().scn(), 3);
    replica.shutdown().await;
}

fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn raft_shard_commits_across_daemons() {
    let names = ["a", "b", "c"];
    let addrs: Vec<SocketAddr> = names.iter().map(|_| free_port()).collect();
    let peers: std::collections::BTreeMap<String, String> = names
        .iter()
        .zip(&addrs)
        .map(|(n, a)| (n.to_string(), a.to_string()))
        .collect();
    let dirs: Vec<_> = names.iter().map(|_| tempfile::tempdir().unwrap()).collect();

    let mut nodes = Vec::new();
    for ((name, addr), dir) in names.iter().zip(&addrs).zip(&dirs) {
        let mut daemon = startup(&Config {
            name: Some(name.to_string()),
            peer_bind_addr: Some(addr.to_string()),
            peers: peers.clone(),
            shards: vec![shard(7, ShardType::Raft, &names)],
            ..config(dir.path())
        })
        .await
        .unwrap();
        daemon.serve().await.unwrap();
        assert_eq!(daemon.peer_addr(), Some(*addr));
        nodes.push(daemon);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let scn = 'submit: loop {
        for node in &nodes {
            let submitted = node
                .context()
                .submit(7, Tag::wal(TagKind::WalData), put("agreed"))
                .await;
            if let Ok(scn) = submitted {
                break 'submit scn;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let ctxs: Vec<_> = nodes.iter().map(|n| n.context().clone()).collect();
    wait_for("every node to apply the entry", || {
        ctxs.iter()
            .all(|ctx| ctx.shard(7).is_some_and(|s| s.scn() >= scn && s.get(b"agreed").is_some()))
    })
    .await;

    for node in nodes {
        node.shutdown().await;
    }
}
