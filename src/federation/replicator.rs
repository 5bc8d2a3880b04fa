//! Federation log replicator
//!
//! On a master zone, the zone leader ships its dense federation log to every
//! slave zone, one record per call, rotating through a slave's endpoints
//! until it reaches that zone's leader. On a slave zone, received records are
//! checked against the local [`FederationCursor`] and replicated through the
//! zone log; the cursor moves when the record is applied. Slaves never vote
//! in or lead the master zone.

use crate::common::raft::{FedReplicateRequest, FedReplicateResponse, FED_FAILURE};
use crate::common::{Error, FederationConfig, FederationMode, RaftMetrics, Result, ZoneId};
use crate::federation::FedSink;
use crate::log::LogStore;
use crate::rpc::transport::Transport;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Highest federation index applied by this zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationCursor {
    pub last_applied_index: u64,
}

/// Slave-side verdict on one received record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FedApplyOutcome {
    Applied,
    /// Index at or below the cursor; nothing to do
    AlreadyApplied,
    /// Out of order; the master should resend after this index
    Resend(u64),
}

impl FedApplyOutcome {
    /// Wire reply, failures map to [`FedReplicateResponse::failure`]
    pub fn to_response(result: &Result<FedApplyOutcome>) -> FedReplicateResponse {
        match result {
            Ok(FedApplyOutcome::Applied) | Ok(FedApplyOutcome::AlreadyApplied) => {
                FedReplicateResponse::applied()
            }
            Ok(FedApplyOutcome::Resend(cursor)) => FedReplicateResponse::resend(*cursor),
            Err(_) => FedReplicateResponse::failure(),
        }
    }
}

/// Master-side shipping state for one slave zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveProgress {
    pub zone_id: ZoneId,
    pub endpoints: Vec<String>,
    /// Endpoint currently believed to reach the slave zone leader
    pub current: usize,
    pub next_index: u64,
}

impl SlaveProgress {
    fn endpoint(&self) -> Option<&str> {
        self.endpoints.get(self.current).map(String::as_str)
    }

    fn rotate(&mut self) {
        if !self.endpoints.is_empty() {
            self.current = (self.current + 1) % self.endpoints.len();
        }
    }
}

pub struct FedReplicaManager {
    zone_id: ZoneId,
    mode: FederationMode,
    cache: bool,
    fed_log: LogStore,
    sink: Arc<dyn FedSink>,
    transport: Arc<dyn Transport>,
    slaves: Mutex<Vec<SlaveProgress>>,
    ship_interval: Duration,
    /// Bound on one shipping call; covers the slave's own replication
    call_timeout: Duration,
    metrics: Arc<RaftMetrics>,
    stopped: AtomicBool,
}

impl FedReplicaManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        zone_id: ZoneId,
        cache: bool,
        config: &FederationConfig,
        fed_log: LogStore,
        sink: Arc<dyn FedSink>,
        transport: Arc<dyn Transport>,
        call_timeout: Duration,
        metrics: Arc<RaftMetrics>,
    ) -> Self {
        // open with the newest record; slaves answer with their cursor
        let start = fed_log.last_index().max(1);
        let slaves = match config.mode {
            FederationMode::Master => config
                .slaves
                .iter()
                .map(|s| SlaveProgress {
                    zone_id: s.zone_id,
                    endpoints: s.endpoints.clone(),
                    current: 0,
                    next_index: start,
                })
                .collect(),
            _ => Vec::new(),
        };

        Self {
            zone_id,
            mode: config.mode,
            cache,
            fed_log,
            sink,
            transport,
            slaves: Mutex::new(slaves),
            ship_interval: config.ship_interval(),
            call_timeout,
            metrics,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> FederationMode {
        self.mode
    }

    pub fn cursor(&self) -> FederationCursor {
        FederationCursor {
            last_applied_index: self.fed_log.last_index(),
        }
    }

    pub fn fed_log(&self) -> &LogStore {
        &self.fed_log
    }

    pub fn slave_progress(&self) -> Vec<SlaveProgress> {
        self.slaves.lock().clone()
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    // === Slave side ===

    /// Handle one record shipped by the master
    pub async fn apply_log_record(&self, req: &FedReplicateRequest) -> Result<FedApplyOutcome> {
        if self.cache {
            return Err(Error::CacheMode);
        }
        if self.mode != FederationMode::Slave {
            return Err(Error::Federation(format!(
                "zone {} is not a federation slave",
                self.zone_id
            )));
        }
        if req.sql.is_empty() {
            return Err(Error::Malformed(format!(
                "empty federation record at index {}",
                req.index
            )));
        }

        let cursor = self.fed_log.last_index();
        if req.index <= cursor {
            debug!("federation record {} already applied (cursor {})", req.index, cursor);
            return Ok(FedApplyOutcome::AlreadyApplied);
        }
        if req.index != cursor + 1 || req.prev != cursor {
            debug!(
                "federation record {} (prev {}) out of order, cursor {}",
                req.index, req.prev, cursor
            );
            return Ok(FedApplyOutcome::Resend(cursor));
        }

        if !self.sink.is_leader() {
            return Err(Error::NotLeader {
                leader: self.sink.leader_hint(),
                endpoint: None,
            });
        }

        self.sink.submit_federated(req.index, &req.sql).await?;
        self.metrics.fed_records_applied.inc();

        let cursor = self.fed_log.last_index();
        if cursor < req.index {
            return Err(Error::Federation(format!(
                "record {} applied but cursor is {}",
                req.index, cursor
            )));
        }
        Ok(FedApplyOutcome::Applied)
    }

    // === Master side ===

    /// Ship every pending record to every slave zone. No-op unless this
    /// server leads a master zone.
    pub async fn ship_pending(&self) {
        if self.mode != FederationMode::Master || !self.sink.is_leader() {
            return;
        }

        let slaves = self.slaves.lock().clone();
        let updated = join_all(slaves.into_iter().map(|slave| self.ship_to(slave))).await;
        *self.slaves.lock() = updated;
    }

    async fn ship_to(&self, mut slave: SlaveProgress) -> SlaveProgress {
        let last = self.fed_log.last_index();

        while slave.next_index <= last {
            let Some(record) = self.fed_log.get(slave.next_index) else {
                break;
            };
            let Some(endpoint) = slave.endpoint().map(str::to_string) else {
                break;
            };

            let req = FedReplicateRequest {
                index: record.index,
                prev: record.index - 1,
                sql: record.sql,
            };

            let started = Instant::now();
            let result = tokio::time::timeout(
                self.call_timeout,
                self.transport.replicate_fed_log(&endpoint, req),
            )
            .await;
            self.metrics.observe_rpc(started.elapsed());

            match result {
                Ok(Ok(resp)) if resp.success => {
                    self.metrics.fed_records_shipped.inc();
                    slave.next_index += 1;
                }
                Ok(Ok(resp)) if resp.resume_index == FED_FAILURE => {
                    debug!(
                        "slave zone {} refused record {} at {}, trying next endpoint",
                        slave.zone_id, record.index, endpoint
                    );
                    slave.rotate();
                    break;
                }
                Ok(Ok(resp)) => {
                    self.metrics.fed_resends.inc();
                    let resume = resp.resume_index.min(last) + 1;
                    info!(
                        "slave zone {} is at {}, resuming shipping from {}",
                        slave.zone_id, resp.resume_index, resume
                    );
                    slave.next_index = resume;
                }
                Ok(Err(e)) => {
                    debug!("shipping to slave zone {} via {} failed: {}", slave.zone_id, endpoint, e);
                    slave.rotate();
                    break;
                }
                Err(_) => {
                    warn!("shipping to slave zone {} via {} timed out", slave.zone_id, endpoint);
                    slave.rotate();
                    break;
                }
            }
        }
        slave
    }
}

/// Periodic shipping loop for master zones
pub fn start_fed_tasks(fed: Arc<FedReplicaManager>) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        info!(
            "Zone {} federation {:?}: shipping every {:?}",
            fed.zone_id, fed.mode, fed.ship_interval
        );
        loop {
            tokio::time::sleep(fed.ship_interval).await;
            if fed.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            fed.ship_pending().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::raft::{ReplicateRequest, ReplicateResponse, VoteRequest, VoteResponse};
    use crate::common::{ServerId, SlaveZoneConfig, WalSyncPolicy};
    use crate::log::LogRecord;
    use tempfile::TempDir;

    /// Zone log stand-in: applies straight into the federation log
    struct DirectSink {
        fed_log: LogStore,
        leader: bool,
    }

    #[tonic::async_trait]
    impl FedSink for DirectSink {
        fn is_leader(&self) -> bool {
            self.leader
        }

        fn leader_hint(&self) -> Option<ServerId> {
            None
        }

        async fn submit_federated(&self, fed_index: u64, sql: &str) -> Result<u64> {
            self.fed_log
                .append_applied_if_absent(LogRecord::new(fed_index, 1, sql, fed_index))?;
            Ok(fed_index)
        }
    }

    struct NoTransport;

    #[tonic::async_trait]
    impl Transport for NoTransport {
        async fn request_vote(&self, e: &str, _: VoteRequest) -> Result<VoteResponse> {
            Err(Error::ConnectionFailed(e.into()))
        }
        async fn replicate_log(&self, e: &str, _: ReplicateRequest) -> Result<ReplicateResponse> {
            Err(Error::ConnectionFailed(e.into()))
        }
        async fn replicate_fed_log(
            &self,
            e: &str,
            _: FedReplicateRequest,
        ) -> Result<FedReplicateResponse> {
            Err(Error::ConnectionFailed(e.into()))
        }
    }

    fn slave(dir: &TempDir, leader: bool, cache: bool) -> FedReplicaManager {
        let fed_log =
            LogStore::open(dir.path().join("federation.wal"), WalSyncPolicy::Never).unwrap();
        let config = FederationConfig {
            mode: FederationMode::Slave,
            master_zone_id: Some(0),
            ..FederationConfig::default()
        };
        FedReplicaManager::new(
            1,
            cache,
            &config,
            fed_log.clone(),
            Arc::new(DirectSink { fed_log, leader }),
            Arc::new(NoTransport),
            Duration::from_millis(50),
            Arc::new(RaftMetrics::new()),
        )
    }

    fn record(index: u64, prev: u64, sql: &str) -> FedReplicateRequest {
        FedReplicateRequest {
            index,
            prev,
            sql: sql.to_string(),
        }
    }

    #[tokio::test]
    async fn test_slave_applies_next_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let fed = slave(&dir, true, false);
        for i in 1..=9 {
            fed.apply_log_record(&record(i, i - 1, "INSERT PRIOR")).await.unwrap();
        }
        assert_eq!(fed.cursor().last_applied_index, 9);

        let outcome = fed.apply_log_record(&record(10, 9, "X")).await.unwrap();
        assert_eq!(outcome, FedApplyOutcome::Applied);
        assert_eq!(fed.cursor().last_applied_index, 10);

        let again = fed.apply_log_record(&record(10, 9, "X")).await;
        assert_eq!(again.as_ref().unwrap(), &FedApplyOutcome::AlreadyApplied);
        assert_eq!(FedApplyOutcome::to_response(&again), FedReplicateResponse::applied());
        assert_eq!(fed.cursor().last_applied_index, 10);
    }

    #[tokio::test]
    async fn test_gap_asks_for_resend() {
        let dir = tempfile::tempdir().unwrap();
        let fed = slave(&dir, true, false);
        fed.apply_log_record(&record(1, 0, "INSERT A")).await.unwrap();

        let outcome = fed.apply_log_record(&record(5, 4, "INSERT E")).await;
        assert_eq!(outcome.as_ref().unwrap(), &FedApplyOutcome::Resend(1));
        let wire = FedApplyOutcome::to_response(&outcome);
        assert!(!wire.success);
        assert_eq!(wire.resume_index, 1);

        // right index but wrong predecessor
        let outcome = fed.apply_log_record(&record(2, 0, "INSERT B")).await.unwrap();
        assert_eq!(outcome, FedApplyOutcome::Resend(1));
    }

    #[tokio::test]
    async fn test_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let cached = slave(&dir, true, true);
        assert!(matches!(
            cached.apply_log_record(&record(1, 0, "X")).await,
            Err(Error::CacheMode)
        ));

        let dir = tempfile::tempdir().unwrap();
        let fed = slave(&dir, true, false);
        let empty = fed.apply_log_record(&record(1, 0, "")).await;
        assert!(matches!(empty, Err(Error::Malformed(_))));
        assert_eq!(FedApplyOutcome::to_response(&empty).resume_index, FED_FAILURE);

        let dir = tempfile::tempdir().unwrap();
        let follower = slave(&dir, false, false);
        assert!(matches!(
            follower.apply_log_record(&record(1, 0, "X")).await,
            Err(Error::NotLeader { .. })
        ));
    }

    #[tokio::test]
    async fn test_master_refuses_records() {
        let dir = tempfile::tempdir().unwrap();
        let fed_log =
            LogStore::open(dir.path().join("federation.wal"), WalSyncPolicy::Never).unwrap();
        let config = FederationConfig {
            mode: FederationMode::Master,
            slaves: vec![SlaveZoneConfig {
                zone_id: 1,
                endpoints: vec!["local://a".into(), "local://b".into()],
            }],
            ..FederationConfig::default()
        };
        let fed = FedReplicaManager::new(
            0,
            false,
            &config,
            fed_log.clone(),
            Arc::new(DirectSink {
                fed_log: fed_log.clone(),
                leader: true,
            }),
            Arc::new(NoTransport),
            Duration::from_millis(10),
            Arc::new(RaftMetrics::new()),
        );

        assert!(matches!(
            fed.apply_log_record(&record(1, 0, "X")).await,
            Err(Error::Federation(_))
        ));

        // unreachable slave endpoint gets rotated
        fed_log
            .append_applied_if_absent(LogRecord::new(1, 1, "INSERT A", 1))
            .unwrap();
        fed.ship_pending().await;
        let progress = fed.slave_progress();
        assert_eq!(progress[0].current, 1);
        assert_eq!(progress[0].next_index, 1);
    }
}
