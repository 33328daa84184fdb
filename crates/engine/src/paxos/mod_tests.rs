// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::context::ContextConfig;
use crate::peer::read_history;
use crate::recovery::Recovery;
use crate::snapshot::write_snapshot;
use std::path::Path;
use tempfile::TempDir;
use tl_adapters::{FakeNetwork, FakeTransport};
use tl_core::{FakeClock, KvOp, ShardOp};
use tl_storage::XlogReader;

const NODES: [&str; 3] = ["a", "b", "c"];
const SHARD: ShardId = 1;

type Group = Arc<PaxosGroup<FakeTransport, FakeClock>>;

struct Node {
    ctx: Context<FakeClock>,
    group: Group,
}

fn context(root: &Path) -> Context<FakeClock> {
    let wal = LogDir::wal(root.join("wal")).unwrap();
    let snap = LogDir::snap(root.join("snap")).unwrap();
    Context::new(FakeClock::new(), wal, snap, ContextConfig::default())
}

fn shard_op() -> ShardOp {
    ShardOp::new(
        ShardType::Paxos,
        "tree",
        NODES.iter().map(|n| n.to_string()).collect(),
    )
}

fn config() -> PaxosConfig {
    PaxosConfig {
        call_timeout: Duration::from_millis(500),
        max_attempts: 30,
        retry_delay: Duration::from_millis(2),
        fetch_batch: 4,
    }
}

fn put(key: &str) -> Bytes {
    KvOp::put(key.to_string(), "v".to_string()).encode()
}

fn data_tag() -> Tag {
    Tag::wal(TagKind::WalData)
}

async fn cluster(tmp: &TempDir, net: &FakeNetwork, config: PaxosConfig) -> Vec<Node> {
    let mut nodes = Vec::new();
    for name in NODES {
        let ctx = context(&tmp.path().join(name));
        ctx.start_wal().unwrap();
        ctx.create_shard(SHARD, shard_op()).await.unwrap();
        let router = Arc::new(PeerRouter::new());
        let group = PaxosGroup::start(
            &ctx,
            &router,
            SHARD,
            name,
            net.transport(name),
            config.clone(),
        )
        .unwrap();
        net.register(name, router);
        nodes.push(Node { ctx, group });
    }
    nodes
}

async fn wait_for_scn(node: &Node, scn: Scn) {
    for _ in 0..500 {
        if node.group.shard().scn() >= scn {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node never reached scn {scn}");
}

fn history(node: &Node) -> Vec<Decided> {
    read_history(node.ctx.wal_dir(), SHARD, 1, 1000).unwrap()
}

/// Count rows of `kind` in a node's WAL
fn count_rows(node: &Node, kind: TagKind) -> usize {
    let mut count = 0;
    for file in node.ctx.wal_dir().files().unwrap() {
        let reader = XlogReader::open(&file.path, tl_storage::FileKind::Xlog).unwrap();
        for row in reader.rows().unwrap() {
            let Ok(row) = row else {
                break;
            };
            if row.tag.kind() == kind {
                count += 1;
            }
        }
    }
    count
}

#[tokio::test]
async fn minority_partition_then_catch_up() {
    let tmp = TempDir::new().unwrap();
    let net = FakeNetwork::new();
    let nodes = cluster(&tmp, &net, config()).await;
    net.isolate("c");

    for i in 1..=10 {
        let scn = nodes[0]
            .ctx
            .submit(SHARD, data_tag(), put(&format!("k{i}")))
            .await
            .unwrap();
        assert_eq!(scn, i);
    }
    wait_for_scn(&nodes[1], 10).await;
    assert_eq!(nodes[2].group.shard().scn(), 0);

    net.heal("c");
    let applied = nodes[2].group.catch_up().await.unwrap();
    assert_eq!(applied, 10);
    assert_eq!(nodes[2].group.shard().scn(), 10);
    assert!(nodes[2].group.shard().get(b"k10").is_some());

    // learned from history, never decided again
    let stats = nodes[2].group.stats();
    assert_eq!(stats.learned, 10);
    assert_eq!(stats.decided, 0);
    assert_eq!(count_rows(&nodes[2], TagKind::PaxosPromise), 0);
    assert_eq!(count_rows(&nodes[2], TagKind::PaxosAccept), 0);

    let expected = history(&nodes[0]);
    assert_eq!(expected.len(), 10);
    for node in &nodes[1..] {
        assert_eq!(history(node), expected);
    }
    for node in &nodes {
        node.ctx.shutdown().await;
    }
}

#[tokio::test]
async fn competing_proposers_agree_on_every_scn() {
    let tmp = TempDir::new().unwrap();
    let net = FakeNetwork::new();
    let nodes = cluster(&tmp, &net, config()).await;

    let mut tasks = Vec::new();
    for (n, node) in nodes.iter().enumerate().take(2) {
        for i in 0..5 {
            let ctx = node.ctx.clone();
            tasks.push(tokio::spawn(async move {
                ctx.submit(SHARD, data_tag(), put(&format!("n{n}-{i}"))).await
            }));
        }
    }
    let mut scns = Vec::new();
    for task in tasks {
        scns.push(task.await.unwrap().unwrap());
    }
    scns.sort_unstable();
    assert_eq!(scns, (1..=10).collect::<Vec<_>>());

    for node in &nodes {
        wait_for_scn(node, 10).await;
    }
    let expected = history(&nodes[0]);
    assert_eq!(expected.len(), 10);
    for node in &nodes[1..] {
        assert_eq!(history(node), expected, "one value per scn on every node");
    }
    for node in &nodes {
        node.ctx.shutdown().await;
    }
}

#[tokio::test]
async fn no_progress_without_a_majority() {
    let tmp = TempDir::new().unwrap();
    let net = FakeNetwork::new();
    let config = PaxosConfig {
        max_attempts: 3,
        retry_delay: Duration::from_millis(1),
        ..config()
    };
    let nodes = cluster(&tmp, &net, config).await;
    net.isolate("b");
    net.isolate("c");

    let err = nodes[0]
        .ctx
        .submit(SHARD, data_tag(), put("lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::Consensus(_)), "{err:?}");
    assert_eq!(nodes[0].group.shard().scn(), 0);

    net.heal("b");
    let scn = nodes[0].ctx.submit(SHARD, data_tag(), put("kept")).await.unwrap();
    assert_eq!(scn, 1);
    for node in &nodes {
        node.ctx.shutdown().await;
    }
}

#[tokio::test]
async fn acceptor_refuses_lower_ballots() {
    let tmp = TempDir::new().unwrap();
    let net = FakeNetwork::new();
    let nodes = cluster(&tmp, &net, config()).await;
    let b = &nodes[1].group;

    let reply = b.handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 5 << 8 }).await.unwrap();
    assert!(matches!(reply, PaxosMsg::Promise { accepted: None, .. }));
    let reply = b.handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 3 << 8 }).await.unwrap();
    assert_eq!(reply, PaxosMsg::Nack { scn: 1, promised: 5 << 8 });

    let accept = |ballot| PaxosMsg::Accept {
        scn: 1,
        ballot,
        tag: data_tag(),
        value: put("x"),
    };
    let reply = b.handle_msg(accept(4 << 8)).await.unwrap();
    assert!(matches!(reply, PaxosMsg::Nack { .. }));
    let reply = b.handle_msg(accept(5 << 8)).await.unwrap();
    assert_eq!(reply, PaxosMsg::Accepted { scn: 1, ballot: 5 << 8 });

    // a later prepare learns the accepted value
    match b.handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 6 << 8 }).await.unwrap() {
        PaxosMsg::Promise {
            accepted: Some(a), ..
        } => assert_eq!(a.value, put("x")),
        other => panic!("unexpected {other:?}"),
    }
    for node in &nodes {
        node.ctx.shutdown().await;
    }
}

#[tokio::test]
async fn decided_scns_answer_with_their_value() {
    let tmp = TempDir::new().unwrap();
    let net = FakeNetwork::new();
    let nodes = cluster(&tmp, &net, config()).await;
    nodes[0].ctx.submit(SHARD, data_tag(), put("first")).await.unwrap();

    let reply = nodes[0]
        .group
        .handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 99 << 8 })
        .await
        .unwrap();
    match reply {
        PaxosMsg::Decided(d) => assert_eq!((d.scn, d.value), (1, put("first"))),
        other => panic!("unexpected {other:?}"),
    }
    for node in &nodes {
        node.ctx.shutdown().await;
    }
}

#[tokio::test]
async fn promises_survive_a_restart() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("solo");
    let op = ShardOp::new(ShardType::Paxos, "hash", vec!["solo".into(), "gone".into()]);
    {
        let ctx = context(&root);
        ctx.start_wal().unwrap();
        ctx.create_shard(SHARD, op.clone()).await.unwrap();
        let net = FakeNetwork::new();
        let group = PaxosGroup::new(&ctx, SHARD, "solo", net.transport("solo"), config()).unwrap();
        let reply = group
            .handle_msg(PaxosMsg::Accept {
                scn: 1,
                ballot: 7 << 8,
                tag: data_tag(),
                value: put("pending"),
            })
            .await
            .unwrap();
        assert!(matches!(reply, PaxosMsg::Accepted { .. }));
        ctx.shutdown().await;
    }

    let mut recovery = Recovery::new(context(&root));
    recovery.load_full(None).unwrap();
    let ctx = recovery.context().clone();
    ctx.start_wal().unwrap();
    let net = FakeNetwork::new();
    let group = PaxosGroup::new(&ctx, SHARD, "solo", net.transport("solo"), config()).unwrap();

    let reply = group
        .handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 6 << 8 })
        .await
        .unwrap();
    assert_eq!(reply, PaxosMsg::Nack { scn: 1, promised: 7 << 8 });
    match group.handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 8 << 8 }).await.unwrap() {
        PaxosMsg::Promise {
            accepted: Some(a), ..
        } => assert_eq!(a.value, put("pending")),
        other => panic!("unexpected {other:?}"),
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn snapshots_keep_promises() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("solo");
    let op = ShardOp::new(ShardType::Paxos, "hash", vec!["solo".into(), "gone".into()]);
    {
        let ctx = context(&root);
        ctx.start_wal().unwrap();
        ctx.create_shard(SHARD, op.clone()).await.unwrap();
        let net = FakeNetwork::new();
        let router = PeerRouter::new();
        let group =
            PaxosGroup::start(&ctx, &router, SHARD, "solo", net.transport("solo"), config()).unwrap();
        group
            .handle_msg(PaxosMsg::Accept {
                scn: 1,
                ballot: 7 << 8,
                tag: data_tag(),
                value: put("pending"),
            })
            .await
            .unwrap();
        group
            .handle_msg(PaxosMsg::Prepare { scn: 2, ballot: 9 << 8 })
            .await
            .unwrap();
        // the snapshot covers every row logged so far
        let view = ctx.snapshot_view();
        assert_eq!(view.shards[0].consensus_rows.len(), 2);
        write_snapshot(ctx.snap_dir(), &view, 0.0).unwrap();
        ctx.shutdown().await;
    }

    let mut recovery = Recovery::new(context(&root));
    recovery.load_full(None).unwrap();
    let ctx = recovery.context().clone();
    ctx.start_wal().unwrap();
    let net = FakeNetwork::new();
    let group = PaxosGroup::new(&ctx, SHARD, "solo", net.transport("solo"), config()).unwrap();

    let reply = group
        .handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 6 << 8 })
        .await
        .unwrap();
    assert_eq!(reply, PaxosMsg::Nack { scn: 1, promised: 7 << 8 });
    let reply = group
        .handle_msg(PaxosMsg::Prepare { scn: 2, ballot: 8 << 8 })
        .await
        .unwrap();
    assert_eq!(reply, PaxosMsg::Nack { scn: 2, promised: 9 << 8 });
    match group.handle_msg(PaxosMsg::Prepare { scn: 1, ballot: 8 << 8 }).await.unwrap() {
        PaxosMsg::Promise {
            accepted: Some(a), ..
        } => assert_eq!(a.value, put("pending")),
        other => panic!("unexpected {other:?}"),
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn proposals_take_over_an_accepted_value() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    ctx.start_wal().unwrap();
    let op = ShardOp::new(ShardType::Paxos, "hash", vec!["solo".into()]);
    ctx.create_shard(SHARD, op).await.unwrap();
    let net = FakeNetwork::new();
    let group = PaxosGroup::new(&ctx, SHARD, "solo", net.transport("solo"), config()).unwrap();
    group
        .handle_msg(PaxosMsg::Accept {
            scn: 1,
            ballot: 1,
            tag: data_tag(),
            value: put("earlier"),
        })
        .await
        .unwrap();

    let mut proposal = Proposal::new(1, data_tag(), put("later"));
    group.decide(&mut proposal).await.unwrap();
    assert!(proposal.applied && proposal.waled);
    assert!(proposal.ballot > 1);
    assert_eq!(proposal.value, put("earlier"));
    assert_eq!(group.shard().scn(), 1);

    // the original value moves on to the next scn
    assert_eq!(group.propose(data_tag(), put("later")).await.unwrap(), 2);
    ctx.shutdown().await;
}

#[tokio::test]
async fn groups_need_a_paxos_shard_they_belong_to() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(tmp.path());
    ctx.start_wal().unwrap();
    ctx.create_shard(SHARD, shard_op()).await.unwrap();
    let net = FakeNetwork::new();

    let err = PaxosGroup::new(&ctx, SHARD, "zed", net.transport("zed"), config()).err().unwrap();
    assert!(matches!(err, ShardError::Consensus(msg) if msg.contains("not a member")));
    assert!(PaxosGroup::new(&ctx, 9, "a", net.transport("a"), config()).is_err());
    ctx.shutdown().await;
}
