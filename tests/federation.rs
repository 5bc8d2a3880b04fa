//! Federation: a master zone ships its federation log to a slave zone

mod common;

use common::{master_federation, slave_federation, wait_until, Cluster, WAIT};
use zonelog::common::raft::FedReplicateRequest;
use zonelog::federation::FedApplyOutcome;
use zonelog::Error;

const MASTER: i32 = 0;
const SLAVE: i32 = 1;

fn federated_zones() -> (Cluster, Vec<usize>, Vec<usize>) {
    let mut cluster = Cluster::new();
    let slave = cluster.start_zone_with(SLAVE, 3, slave_federation(MASTER));
    let master = cluster.start_zone_with(MASTER, 3, master_federation(SLAVE, &[0, 1, 2]));
    (cluster, master, slave)
}

fn fed_cursor(cluster: &Cluster, slot: usize) -> u64 {
    cluster.raft(slot).status().fed_cursor
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_federated_commands_reach_every_slave_server() {
    let (cluster, master, slave) = federated_zones();
    let leader = cluster.wait_leader(MASTER).await;
    cluster.wait_leader(SLAVE).await;

    for i in 1..=3 {
        let sql = format!("INSERT INTO flavors VALUES ({})", i);
        cluster.node(leader).ctx.execute_federated(&sql).await.unwrap();
    }
    // zone-local commands stay in the master zone
    cluster
        .node(leader)
        .ctx
        .execute("INSERT INTO hosts VALUES ('master-only')")
        .await
        .unwrap();

    let shipped = wait_until(WAIT, || {
        master
            .iter()
            .chain(slave.iter())
            .all(|&slot| fed_cursor(&cluster, slot) == 3)
    })
    .await;
    assert!(shipped, "federation cursors did not reach 3");

    for &slot in &slave {
        let log = cluster.raft(slot).log();
        let fed: Vec<(u64, String)> = (1..=log.last_index())
            .filter_map(|i| log.get(i))
            .filter(|r| r.fed_index > 0)
            .map(|r| (r.fed_index, r.sql))
            .collect();
        assert_eq!(
            fed,
            (1..=3)
                .map(|i| (i, format!("INSERT INTO flavors VALUES ({})", i)))
                .collect::<Vec<_>>()
        );
        assert!((1..=log.last_index())
            .filter_map(|i| log.get(i))
            .all(|r| r.sql != "INSERT INTO hosts VALUES ('master-only')"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_master_failover_keeps_shipping() {
    let (mut cluster, master, slave) = federated_zones();
    let leader = cluster.wait_leader(MASTER).await;
    cluster.wait_leader(SLAVE).await;

    cluster
        .node(leader)
        .ctx
        .execute_federated("INSERT INTO flavors VALUES (1)")
        .await
        .unwrap();
    assert!(cluster.wait_applied(MASTER, 1).await);

    cluster.stop(leader).await;
    let survivors: Vec<usize> = master.iter().copied().filter(|&s| s != leader).collect();
    let next = cluster.wait_leader_among(&survivors).await;
    cluster
        .node(next)
        .ctx
        .execute_federated("INSERT INTO flavors VALUES (2)")
        .await
        .unwrap();

    let shipped = wait_until(WAIT, || {
        slave.iter().all(|&slot| fed_cursor(&cluster, slot) == 2)
    })
    .await;
    assert!(shipped, "slave zone did not receive records after failover");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slave_checks_record_order() {
    let (cluster, _master, _slave) = federated_zones();
    let slave_leader = cluster.wait_leader(SLAVE).await;
    let fed = cluster.node(slave_leader).ctx.fed().unwrap().clone();

    let record = |index: u64| FedReplicateRequest {
        index,
        prev: index - 1,
        sql: format!("INSERT INTO flavors VALUES ({})", index),
    };

    // a gap is answered with the cursor so the master resends from there
    assert_eq!(
        fed.apply_log_record(&record(3)).await.unwrap(),
        FedApplyOutcome::Resend(0)
    );
    assert_eq!(
        fed.apply_log_record(&record(1)).await.unwrap(),
        FedApplyOutcome::Applied
    );
    assert_eq!(fed.cursor().last_applied_index, 1);
    assert_eq!(
        fed.apply_log_record(&record(1)).await.unwrap(),
        FedApplyOutcome::AlreadyApplied
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slave_zone_cannot_originate_federated_commands() {
    let (cluster, _master, _slave) = federated_zones();
    let slave_leader = cluster.wait_leader(SLAVE).await;

    let result = cluster
        .node(slave_leader)
        .ctx
        .execute_federated("INSERT INTO flavors VALUES (9)")
        .await;
    assert!(matches!(result, Err(Error::Federation(_))), "{:?}", result);
}
