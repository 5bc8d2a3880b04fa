//! Recovery test: crash and restart from the data directory

mod common;

use common::{wait_until, Cluster, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_restart_keeps_log_and_catches_up() {
    let mut cluster = Cluster::new();
    let slots = cluster.start_zone(0, 3);
    let leader = cluster.wait_leader(0).await;
    let follower = *slots.iter().find(|&&s| s != leader).unwrap();

    for i in 1..=3 {
        let sql = format!("INSERT INTO images VALUES ({})", i);
        cluster.node(leader).ctx.execute(&sql).await.unwrap();
    }
    assert!(cluster.wait_applied(0, 3).await);
    let before = cluster.raft(follower).status();

    cluster.stop(follower).await;
    // progress while it is down
    cluster
        .node(leader)
        .ctx
        .execute("INSERT INTO images VALUES (4)")
        .await
        .unwrap();

    cluster.restart(follower).await;
    // the leader may already be pushing record 4, so only a lower bound holds
    let after = cluster.raft(follower).status();
    assert!(after.last_log_index >= 3);
    assert!(after.applied_index >= 3);
    assert!(after.commit_index >= 3);
    assert!(after.term >= before.term);
    for i in 1..=3 {
        let record = cluster.raft(follower).log().get(i).unwrap();
        assert_eq!(record.sql, format!("INSERT INTO images VALUES ({})", i));
        assert!(record.applied);
    }

    cluster
        .node(leader)
        .ctx
        .execute("INSERT INTO images VALUES (5)")
        .await
        .unwrap();
    assert!(cluster.wait_applied(0, 5).await, "restarted follower did not catch up");
    assert_eq!(
        cluster.raft(follower).log().get(4).unwrap().sql,
        "INSERT INTO images VALUES (4)"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_whole_zone_restart() {
    let mut cluster = Cluster::new();
    let slots = cluster.start_zone(0, 3);
    let leader = cluster.wait_leader(0).await;
    for i in 1..=4 {
        let sql = format!("INSERT INTO vms VALUES ({})", i);
        cluster.node(leader).ctx.execute(&sql).await.unwrap();
    }
    assert!(cluster.wait_applied(0, 4).await);
    let terms: Vec<u32> = slots.iter().map(|&s| cluster.raft(s).term()).collect();

    for &slot in &slots {
        cluster.stop(slot).await;
    }
    for &slot in &slots {
        cluster.restart(slot).await;
    }

    for (i, &slot) in slots.iter().enumerate() {
        let status = cluster.raft(slot).status();
        assert_eq!(status.last_log_index, 4);
        assert_eq!(status.applied_index, 4);
        assert!(status.term >= terms[i], "term went backwards");
        // applied records are not executed a second time
        assert!(cluster.raft(slot).log().get(4).unwrap().applied);
    }

    let leader = cluster.wait_leader(0).await;
    let index = cluster
        .node(leader)
        .ctx
        .execute("INSERT INTO vms VALUES (5)")
        .await
        .unwrap();
    assert_eq!(index, 5);
    assert!(cluster.wait_applied(0, 5).await);

    let directory_intact = wait_until(WAIT, || {
        slots
            .iter()
            .all(|&s| cluster.raft(s).directory().len(0) == 3)
    })
    .await;
    assert!(directory_intact);
}
