//! Randomized partitions: committed records are never lost and logs agree

mod common;

use common::{wait_until, Cluster, WAIT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logs_match_after_random_partitions() {
    let mut rng = StdRng::seed_from_u64(0x2634);
    let mut cluster = Cluster::new();
    let slots = cluster.start_zone(0, 5);
    cluster.wait_leader(0).await;

    // index -> command of every acknowledged write
    let mut committed: BTreeMap<u64, String> = BTreeMap::new();
    let mut command = 0;

    for _round in 0..4 {
        // cut off up to two servers; the rest still form a majority
        let cut = rng.gen_range(0..=2);
        let mut isolated = Vec::new();
        while isolated.len() < cut {
            let slot = slots[rng.gen_range(0..slots.len())];
            if !isolated.contains(&slot) {
                cluster.isolate(slot);
                isolated.push(slot);
            }
        }
        let reachable: Vec<usize> = slots
            .iter()
            .copied()
            .filter(|s| !isolated.contains(s))
            .collect();
        let leader = cluster.wait_leader_among(&reachable).await;

        for _ in 0..rng.gen_range(1..=3) {
            command += 1;
            let sql = format!("INSERT INTO events VALUES ({})", command);
            // a leader deposed mid-write may fail; only acknowledged writes count
            if let Ok(index) = cluster.node(leader).ctx.execute(&sql).await {
                assert!(committed.insert(index, sql).is_none(), "index {} reused", index);
            }
        }

        cluster.heal_all();
    }

    // a final write from the settled leader carries every log forward
    let mut last = None;
    for _attempt in 0..10 {
        let leader = cluster.wait_leader(0).await;
        command += 1;
        let sql = format!("INSERT INTO events VALUES ({})", command);
        if let Ok(index) = cluster.node(leader).ctx.execute(&sql).await {
            assert!(committed.insert(index, sql).is_none(), "index {} reused", index);
            last = Some(index);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    let last = last.expect("no leader accepted the final write");
    assert!(cluster.wait_applied(0, last).await, "zone did not converge");

    // every acknowledged write sits at its index on every server
    for &slot in &slots {
        let log = cluster.raft(slot).log();
        for (&index, sql) in &committed {
            assert_eq!(
                log.get(index).map(|r| r.sql),
                Some(sql.clone()),
                "slot {} lost committed index {}",
                slot,
                index
            );
        }
    }

    // the committed prefix is identical everywhere
    let agree = wait_until(WAIT, || {
        let reference: Vec<_> = (1..=last)
            .map(|i| cluster.raft(slots[0]).log().get(i).map(|r| (r.term, r.sql)))
            .collect();
        slots.iter().all(|&slot| {
            (1..=last)
                .map(|i| cluster.raft(slot).log().get(i).map(|r| (r.term, r.sql)))
                .eq(reference.iter().cloned())
        })
    })
    .await;
    assert!(agree, "committed prefixes differ");
}
