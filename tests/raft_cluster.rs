//! Raft integration test: election and replication inside one zone

mod common;

use common::{wait_until, Cluster, WAIT};
use zonelog::Error;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_servers_elect_one_leader() {
    let mut cluster = Cluster::new();
    let slots = cluster.start_zone(0, 3);

    let leader = cluster.wait_leader(0).await;
    let leader_id = cluster.raft(leader).server_id();
    let term = cluster.raft(leader).term();

    // every server learns the leader through heartbeats
    let agreed = wait_until(WAIT, || {
        slots
            .iter()
            .all(|&slot| cluster.raft(slot).leader_id() == Some(leader_id))
    })
    .await;
    assert!(agreed, "servers disagree on the leader");
    assert_eq!(cluster.leaders(0), vec![leader]);

    for &slot in &slots {
        let status = cluster.raft(slot).status();
        assert!(status.term >= term);
        assert!(!status.halted);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commands_replicate_to_every_server() {
    let mut cluster = Cluster::new();
    let slots = cluster.start_zone(0, 3);
    let leader = cluster.wait_leader(0).await;

    let mut indexes = Vec::new();
    for i in 0..5 {
        let sql = format!("INSERT INTO vms (id) VALUES ({})", i);
        indexes.push(cluster.node(leader).ctx.execute(&sql).await.unwrap());
    }
    assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
    assert_eq!(cluster.raft(leader).commit_index(), 5);

    assert!(cluster.wait_applied(0, 5).await, "followers did not apply");
    let expected: Vec<_> = (1..=5)
        .map(|i| cluster.raft(leader).log().get(i).unwrap())
        .collect();
    for &slot in &slots {
        let raft = cluster.raft(slot);
        assert_eq!(raft.log().last_index(), 5);
        assert_eq!(raft.commit_index(), 5);
        for record in &expected {
            let held = raft.log().get(record.index).unwrap();
            assert_eq!((held.term, &held.sql), (record.term, &record.sql));
            assert!(held.applied);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_redirects_writes_to_leader() {
    let mut cluster = Cluster::new();
    let slots = cluster.start_zone(0, 3);
    let leader = cluster.wait_leader(0).await;
    let leader_id = cluster.raft(leader).server_id();
    let follower = *slots.iter().find(|&&slot| slot != leader).unwrap();

    assert!(
        wait_until(WAIT, || cluster.raft(follower).leader_id() == Some(leader_id)).await
    );

    match cluster.node(follower).ctx.execute("INSERT INTO vms VALUES (1)").await {
        Err(Error::NotLeader { leader: hinted, endpoint }) => {
            assert_eq!(hinted, Some(leader_id));
            assert_eq!(endpoint.as_deref(), Some(cluster.endpoint(leader)));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_server_zone_commits_alone() {
    let mut cluster = Cluster::new();
    let slots = cluster.start_zone(3, 1);
    let leader = cluster.wait_leader(3).await;
    assert_eq!(leader, slots[0]);

    let index = cluster
        .node(leader)
        .ctx
        .execute("UPDATE hosts SET state = 'up'")
        .await
        .unwrap();
    assert_eq!(index, 1);
    assert_eq!(cluster.raft(leader).log().applied_index(), 1);
}
