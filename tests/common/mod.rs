//! In-process zone harness shared by the integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use zonelog::common::{
    Config, FederationConfig, FederationMode, PeerConfig, RaftConfig, SlaveZoneConfig,
    WalSyncPolicy,
};
use zonelog::rpc::LocalNetwork;
use zonelog::{RaftManager, Result, ServerContext};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn endpoint(zone_id: i32, server_id: i32) -> String {
    format!("local://z{}s{}", zone_id, server_id)
}

pub fn fast_raft() -> RaftConfig {
    RaftConfig {
        election_timeout_min_ms: 300,
        election_timeout_max_ms: 600,
        heartbeat_interval_ms: 50,
        rpc_timeout_ms: 100,
        replicate_timeout_ms: 2000,
        membership_wait_ms: 2000,
        tick_ms: 10,
        wal_sync_interval_ms: 200,
    }
}

/// Config of server `server_id` in a zone whose members are `members`
pub fn server_config(root: &Path, zone_id: i32, server_id: i32, members: &[i32]) -> Config {
    Config {
        server_id,
        zone_id,
        endpoint: endpoint(zone_id, server_id),
        data_dir: root.join(format!("z{}s{}", zone_id, server_id)),
        peers: members
            .iter()
            .map(|&id| PeerConfig {
                id,
                name: format!("zs{}", id),
                endpoint: endpoint(zone_id, id),
            })
            .collect(),
        wal_sync: WalSyncPolicy::Interval,
        raft: fast_raft(),
        ..Config::default()
    }
}

pub fn master_federation(slave_zone: i32, slave_members: &[i32]) -> FederationConfig {
    FederationConfig {
        mode: FederationMode::Master,
        master_zone_id: None,
        slaves: vec![SlaveZoneConfig {
            zone_id: slave_zone,
            endpoints: slave_members
                .iter()
                .map(|&id| endpoint(slave_zone, id))
                .collect(),
        }],
        ship_interval_ms: 100,
    }
}

pub fn slave_federation(master_zone: i32) -> FederationConfig {
    FederationConfig {
        mode: FederationMode::Slave,
        master_zone_id: Some(master_zone),
        slaves: Vec::new(),
        ship_interval_ms: 100,
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub struct Node {
    pub ctx: Arc<ServerContext>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl Node {
    pub fn raft(&self) -> &Arc<RaftManager> {
        self.ctx.raft().expect("not a cache server")
    }
}

/// Servers of one or more zones sharing a [`LocalNetwork`]
pub struct Cluster {
    pub network: Arc<LocalNetwork>,
    pub dir: TempDir,
    configs: Vec<Config>,
    nodes: Vec<Option<Node>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            network: LocalNetwork::new(),
            dir: TempDir::new().unwrap(),
            configs: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Start a standalone zone with servers `0..size`. Returns their slots.
    pub fn start_zone(&mut self, zone_id: i32, size: i32) -> Vec<usize> {
        self.start_zone_with(zone_id, size, FederationConfig::default())
    }

    pub fn start_zone_with(
        &mut self,
        zone_id: i32,
        size: i32,
        federation: FederationConfig,
    ) -> Vec<usize> {
        let members: Vec<i32> = (0..size).collect();
        members
            .iter()
            .map(|&id| {
                let mut config = server_config(self.dir.path(), zone_id, id, &members);
                config.federation = federation.clone();
                self.add(config)
            })
            .collect()
    }

    /// Start a server from `config` and return its slot
    pub fn add(&mut self, config: Config) -> usize {
        let node = self.open(config.clone()).expect("open server");
        self.configs.push(config);
        self.nodes.push(Some(node));
        self.nodes.len() - 1
    }

    fn open(&self, config: Config) -> Result<Node> {
        let transport = self.network.transport(config.endpoint.clone());
        let ctx = ServerContext::open(config, transport)?;
        self.network.register(&ctx);
        let tasks = ctx.start();
        Ok(Node { ctx, tasks })
    }

    pub fn node(&self, slot: usize) -> &Node {
        self.nodes[slot].as_ref().expect("server is stopped")
    }

    pub fn raft(&self, slot: usize) -> &Arc<RaftManager> {
        self.node(slot).raft()
    }

    pub fn is_running(&self, slot: usize) -> bool {
        self.nodes[slot].is_some()
    }

    pub fn endpoint(&self, slot: usize) -> &str {
        &self.configs[slot].endpoint
    }

    /// Running slots of `zone_id`
    pub fn zone_slots(&self, zone_id: i32) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&slot| self.configs[slot].zone_id == zone_id && self.is_running(slot))
            .collect()
    }

    /// Running slots of `zone_id` that believe they lead
    pub fn leaders(&self, zone_id: i32) -> Vec<usize> {
        self.zone_slots(zone_id)
            .into_iter()
            .filter(|&slot| self.raft(slot).is_leader())
            .collect()
    }

    /// Wait for a leader among `candidates` and return its slot
    pub async fn wait_leader_among(&self, candidates: &[usize]) -> usize {
        let mut found = None;
        let elected = wait_until(WAIT, || {
            found = candidates
                .iter()
                .copied()
                .find(|&slot| self.is_running(slot) && self.raft(slot).is_leader());
            found.is_some()
        })
        .await;
        assert!(elected, "no leader elected among {:?}", candidates);
        found.unwrap()
    }

    pub async fn wait_leader(&self, zone_id: i32) -> usize {
        let slots = self.zone_slots(zone_id);
        self.wait_leader_among(&slots).await
    }

    /// Wait until every running server of `zone_id` has applied `index`
    pub async fn wait_applied(&self, zone_id: i32, index: u64) -> bool {
        wait_until(WAIT, || {
            self.zone_slots(zone_id)
                .iter()
                .all(|&slot| self.raft(slot).log().applied_index() >= index)
        })
        .await
    }

    /// Crash a server: stop it, cut it off and wait until it is fully dropped
    pub async fn stop(&mut self, slot: usize) {
        let node = self.nodes[slot].take().expect("server already stopped");
        self.network.unregister(&self.configs[slot].endpoint);
        node.ctx.shutdown();
        for task in node.tasks {
            let _ = task.await;
        }

        let ctx: Weak<ServerContext> = Arc::downgrade(&node.ctx);
        let raft: Option<Weak<RaftManager>> = node.ctx.raft().ok().map(Arc::downgrade);
        drop(node.ctx);
        let released = wait_until(WAIT, || {
            ctx.upgrade().is_none() && raft.as_ref().map_or(true, |r| r.upgrade().is_none())
        })
        .await;
        assert!(released, "server {} still referenced after stop", slot);
    }

    /// Start a stopped server again from its data directory
    pub async fn restart(&mut self, slot: usize) {
        let config = self.configs[slot].clone();
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match self.open(config.clone()) {
                Ok(node) => {
                    self.nodes[slot] = Some(node);
                    return;
                }
                // storage locks of the previous instance may linger briefly
                Err(e) if tokio::time::Instant::now() < deadline => {
                    tracing::debug!("reopen of {} failed, retrying: {}", slot, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("could not restart server {}: {}", slot, e),
            }
        }
    }

    pub fn isolate(&self, slot: usize) {
        self.network.isolate(self.endpoint(slot));
    }

    pub fn heal(&self, slot: usize) {
        self.network.heal(self.endpoint(slot));
    }

    pub fn heal_all(&self) {
        self.network.heal_all();
    }

    pub fn shutdown(&mut self) {
        for node in self.nodes.iter_mut().filter_map(Option::take) {
            node.ctx.shutdown();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
