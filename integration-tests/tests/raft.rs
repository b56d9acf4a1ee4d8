use bytes::Bytes;
use integration_tests::cluster::*;
use integration_tests::{eventually, init_log};
use shoal_raft::Index;
use std::time::Duration;

async fn wait_leader(cluster: &RaftCluster, connected: &[usize]) -> usize {
    eventually(Duration::from_secs(10), || cluster.leader(connected))
        .await
        .expect("no leader elected")
}

/// Commit one command through the current leader, confirming it actually
/// landed at the returned slot.
async fn commit_one(cluster: &RaftCluster, connected: &[usize], cmd: &[u8]) -> Index {
    for _ in 0..50 {
        let leader = wait_leader(cluster, connected).await;
        let Some((index, _)) = cluster.nodes[leader]
            .process
            .start(Bytes::copy_from_slice(cmd))
        else {
            continue;
        };
        let committed = eventually(Duration::from_secs(2), || {
            let log = cluster.nodes[leader].applied.lock().unwrap();
            match log.commands.get(&index) {
                Some(c) => Some(c.as_ref() == cmd),
                None if log.last_index >= index => Some(false),
                None => None,
            }
        })
        .await;
        if committed == Some(true) {
            return index;
        }
    }
    panic!("could not commit command");
}

fn applied_matches(node: &RaftNode, index: Index, cmd: &[u8]) -> bool {
    node.applied
        .lock()
        .unwrap()
        .commands
        .get(&index)
        .map(|c| c.as_ref() == cmd)
        .unwrap_or(false)
}

/// Log-matching: shared slots must carry byte-equal commands.
fn assert_agreement(cluster: &RaftCluster) {
    let logs: Vec<_> = cluster
        .nodes
        .iter()
        .map(|n| n.applied.lock().unwrap().commands.clone())
        .collect();
    for a in &logs {
        for b in &logs {
            for (index, cmd) in a {
                if let Some(other) = b.get(index) {
                    assert_eq!(cmd, other, "divergent command at index {index}");
                }
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initial_election() {
    init_log();
    let cluster = RaftCluster::new(3);
    wait_leader(&cluster, &[0, 1, 2]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basic_agreement() {
    init_log();
    let cluster = RaftCluster::new(3);
    let all = [0, 1, 2];
    for k in 0..3 {
        let cmd = format!("cmd-{k}");
        let index = commit_one(&cluster, &all, cmd.as_bytes()).await;
        let ok = eventually(Duration::from_secs(5), || {
            cluster
                .nodes
                .iter()
                .all(|n| applied_matches(n, index, cmd.as_bytes()))
                .then_some(())
        })
        .await;
        assert!(ok.is_some(), "entry {index} did not reach every node");
    }
    assert_agreement(&cluster);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_isolation_and_heal() {
    init_log();
    let cluster = RaftCluster::new(5);
    let all = [0, 1, 2, 3, 4];
    let old_leader = wait_leader(&cluster, &all).await;

    cluster.disconnect(old_leader);
    let rest: Vec<usize> = all.into_iter().filter(|&i| i != old_leader).collect();

    // a new leader emerges among the remaining four and accepts writes
    let index = commit_one(&cluster, &rest, b"x=y").await;
    let ok = eventually(Duration::from_secs(5), || {
        rest.iter()
            .all(|&i| applied_matches(&cluster.nodes[i], index, b"x=y"))
            .then_some(())
    })
    .await;
    assert!(ok.is_some());

    // heal: the deposed leader steps down and catches up on the same entry
    cluster.connect(old_leader);
    let ok = eventually(Duration::from_secs(10), || {
        applied_matches(&cluster.nodes[old_leader], index, b"x=y").then_some(())
    })
    .await;
    assert!(ok.is_some(), "old leader never applied the entry");
    assert_agreement(&cluster);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_recovers_log() {
    init_log();
    let mut cluster = RaftCluster::new(3);
    let all = [0, 1, 2];
    let mut expected = vec![];
    for k in 0..10 {
        let cmd = format!("op-{k}");
        let index = commit_one(&cluster, &all, cmd.as_bytes()).await;
        expected.push((index, cmd));
    }

    cluster.restart(1);

    // drive one commit in the new term so the commit point covers the
    // whole prefix no matter who leads now
    let index = commit_one(&cluster, &all, b"post-restart").await;
    expected.push((index, "post-restart".to_owned()));

    // the rebooted node replays its persisted log once told the commit point
    let ok = eventually(Duration::from_secs(10), || {
        expected
            .iter()
            .all(|(index, cmd)| applied_matches(&cluster.nodes[1], *index, cmd.as_bytes()))
            .then_some(())
    })
    .await;
    assert!(ok.is_some(), "restarted node did not recover the log");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_catches_up_slow_follower() {
    init_log();
    let cluster = RaftCluster::new(3);
    let all = [0, 1, 2];
    for k in 0..20 {
        commit_one(&cluster, &all, format!("a-{k}").as_bytes()).await;
    }
    let leader = wait_leader(&cluster, &all).await;
    let slow = all.into_iter().find(|&i| i != leader).unwrap();
    cluster.disconnect(slow);
    let rest: Vec<usize> = all.into_iter().filter(|&i| i != slow).collect();

    let mut last = 0;
    for k in 0..20 {
        last = commit_one(&cluster, &rest, format!("b-{k}").as_bytes()).await;
    }
    let ok = eventually(Duration::from_secs(5), || {
        rest.iter()
            .all(|&i| cluster.nodes[i].applied.lock().unwrap().last_index >= last)
            .then_some(())
    })
    .await;
    assert!(ok.is_some());

    // compact the connected nodes so the slow follower's entries are gone
    for &i in &rest {
        let applied = cluster.nodes[i].applied.lock().unwrap().last_index;
        cluster.nodes[i]
            .process
            .save_snapshot(applied, Bytes::from("state"));
    }
    let tail = commit_one(&cluster, &rest, b"post-snapshot").await;

    // the follower is too far behind for AppendEntries; it must be handed
    // the snapshot and then the tail
    cluster.connect(slow);
    let ok = eventually(Duration::from_secs(10), || {
        let log = cluster.nodes[slow].applied.lock().unwrap();
        (log.reloads >= 1 && log.commands.get(&tail).map(|c| c.as_ref() == b"post-snapshot")
            == Some(true))
        .then_some(())
    })
    .await;
    assert!(ok.is_some(), "slow follower was not caught up via snapshot");
    assert_agreement(&cluster);
}
