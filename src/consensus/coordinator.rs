//! Replication coordinator
//!
//! `RaftManager` owns one server's [`ConsensusState`] behind a single lock
//! and drives everything around it: vote and append handling on followers,
//! elections, heartbeats and per-follower log shipping on the leader, commit
//! advancement and in-order application of committed records.
//!
//! The state lock is never held across an `.await`. When both locks are
//! needed, `state` is taken before `followers`.

use crate::common::raft::{
    RaftStatus, Rejection, ReplicateRequest, ReplicateResponse, VoteRequest, VoteResponse,
};
use crate::common::{
    quorum, AuditEventType, AuditLogger, Error, RaftConfig, RaftMetrics, Result, ServerId,
    WalSyncPolicy, ZoneId,
};
use crate::consensus::applier::StateApplier;
use crate::consensus::state::{Admission, ConsensusState};
use crate::federation::FedSink;
use crate::log::{LogRecord, LogStore};
use crate::rpc::transport::Transport;
use crate::zone::directory::ZoneDirectory;
use crate::zone::membership::MembershipChange;
use crate::zone::metadata::MetadataStore;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Command a new leader appends when it holds uncommitted records from
/// earlier terms. Replicated like any record, never applied.
pub const LEADER_NOOP: &str = "-- leader no-op";

/// Federation sequence number to attach to a new record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FedTag {
    /// Zone-local command
    None,
    /// Record received from the federation master with this index
    Assign(u64),
    /// Next index of this master's federation log
    Next,
}

/// Leader-side view of one follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerProgress {
    pub next_index: u64,
    pub match_index: u64,
    in_flight: bool,
}

impl FollowerProgress {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            in_flight: false,
        }
    }
}

/// Everything a [`RaftManager`] is built from
pub struct RaftParts {
    pub server_id: ServerId,
    pub zone_id: ZoneId,
    pub config: RaftConfig,
    pub log: LogStore,
    /// Present when the zone takes part in federation
    pub fed_log: Option<LogStore>,
    pub applier: Arc<dyn StateApplier>,
    pub metadata: Arc<MetadataStore>,
    pub directory: Arc<ZoneDirectory>,
    pub transport: Arc<dyn Transport>,
    pub metrics: Arc<RaftMetrics>,
    pub audit: Arc<AuditLogger>,
}

pub struct RaftManager {
    server_id: ServerId,
    zone_id: ZoneId,
    config: RaftConfig,
    state: Mutex<ConsensusState>,
    followers: Mutex<HashMap<ServerId, FollowerProgress>>,
    log: LogStore,
    fed_log: Option<LogStore>,
    applier: Arc<dyn StateApplier>,
    metadata: Arc<MetadataStore>,
    directory: Arc<ZoneDirectory>,
    transport: Arc<dyn Transport>,
    metrics: Arc<RaftMetrics>,
    audit: Arc<AuditLogger>,
    /// Highest locally applied index
    applied_tx: watch::Sender<u64>,
    /// Match index of every tracked follower (leader only)
    replicated_tx: watch::Sender<HashMap<ServerId, u64>>,
    /// Servers added to a two-member zone, with the index of their
    /// `Add`. Tracked once the existing followers hold that index.
    pending_joins: Mutex<Vec<(ServerId, u64)>>,
    wake: Notify,
    halted: AtomicBool,
    stopped: AtomicBool,
}

impl RaftManager {
    pub fn new(parts: RaftParts) -> Result<Self> {
        let hard = parts.metadata.load_hard_state()?;
        let mut state = ConsensusState::new(
            parts.server_id,
            hard,
            parts.config.election_timeout_bounds(),
        );

        // anything applied before the restart was committed
        let applied = parts.log.applied_index();
        state.advance_commit(applied);

        parts.metrics.term.set(hard.term as u64);
        parts.metrics.commit_index.set(applied);

        info!(
            "Server {} (zone {}) starting as follower: term {}, last index {}, applied {}",
            parts.server_id,
            parts.zone_id,
            hard.term,
            parts.log.last_index(),
            applied
        );

        let (applied_tx, _) = watch::channel(applied);
        let (replicated_tx, _) = watch::channel(HashMap::new());

        Ok(Self {
            server_id: parts.server_id,
            zone_id: parts.zone_id,
            config: parts.config,
            state: Mutex::new(state),
            followers: Mutex::new(HashMap::new()),
            log: parts.log,
            fed_log: parts.fed_log,
            applier: parts.applier,
            metadata: parts.metadata,
            directory: parts.directory,
            transport: parts.transport,
            metrics: parts.metrics,
            audit: parts.audit,
            applied_tx,
            replicated_tx,
            pending_joins: Mutex::new(Vec::new()),
            wake: Notify::new(),
            halted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    pub fn directory(&self) -> &Arc<ZoneDirectory> {
        &self.directory
    }

    pub fn metrics(&self) -> &Arc<RaftMetrics> {
        &self.metrics
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().is_leader()
    }

    pub fn leader_id(&self) -> Option<ServerId> {
        self.state.lock().leader_id()
    }

    pub fn term(&self) -> u32 {
        self.state.lock().term()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Stop the background loop and refuse further calls
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn status(&self) -> RaftStatus {
        let state = self.state.lock();
        let (last_log_index, last_log_term) = self.log.last_position();
        RaftStatus {
            server_id: self.server_id,
            zone_id: self.zone_id,
            term: state.term(),
            role: state.role(),
            leader_id: state.leader_id(),
            commit_index: state.commit_index(),
            voted_for: state.voted_for(),
            last_log_index,
            last_log_term,
            applied_index: self.log.applied_index(),
            fed_cursor: self.fed_log.as_ref().map(|l| l.last_index()).unwrap_or(0),
            halted: self.is_halted(),
        }
    }

    /// Snapshot of the leader's follower progress
    pub fn follower_progress(&self) -> HashMap<ServerId, FollowerProgress> {
        self.followers.lock().clone()
    }

    // === Failure handling ===

    fn ensure_running(&self) -> Result<()> {
        if self.is_halted() {
            return Err(Error::Halted);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("server is shutting down".into()));
        }
        Ok(())
    }

    /// Stop participating after a storage failure
    pub fn halt(&self, cause: &Error) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(
                "Server {} halting after storage failure: {}",
                self.server_id, cause
            );
            self.audit.log_event(
                AuditEventType::Halted,
                format!("server/{}", self.server_id),
                None,
                cause.to_string(),
                None,
            );
            self.wake.notify_one();
        }
    }

    fn check_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.halt(e);
            }
        }
        result
    }

    /// fsync the logs that defer syncing to a timer
    fn sync_logs(&self) -> Result<()> {
        for log in std::iter::once(&self.log).chain(self.fed_log.as_ref()) {
            if log.sync_policy() == WalSyncPolicy::Interval {
                log.sync()?;
            }
        }
        Ok(())
    }

    fn persist(&self, state: &ConsensusState) -> Result<()> {
        self.metadata.save_hard_state(&state.hard_state())?;
        self.metrics.term.set(state.term() as u64);
        Ok(())
    }

    fn leadership_lost(&self, state: &ConsensusState) {
        self.followers.lock().clear();
        self.pending_joins.lock().clear();
        info!(
            "Server {} lost leadership, now follower in term {}",
            self.server_id,
            state.term()
        );
        self.audit.log_event(
            AuditEventType::LeadershipLost,
            format!("server/{}", self.server_id),
            None,
            format!("term {}", state.term()),
            None,
        );
    }

    fn not_leader(&self, state: &ConsensusState) -> Error {
        let leader = state.leader_id().filter(|&id| id != self.server_id);
        Error::NotLeader {
            leader,
            endpoint: leader.and_then(|id| self.directory.endpoint(self.zone_id, id)),
        }
    }

    fn observe_higher_term(&self, term: u32) -> Result<()> {
        let mut state = self.state.lock();
        let was_leader = state.is_leader();
        if state.observe_term(term) {
            self.persist(&state)?;
            if was_leader {
                self.leadership_lost(&state);
            }
        }
        Ok(())
    }

    // === Follower side ===

    /// Vote RPC
    pub fn handle_vote(&self, req: &VoteRequest) -> Result<VoteResponse> {
        self.ensure_running()?;
        let result = self.vote_locked(req);
        self.check_fatal(result)
    }

    fn vote_locked(&self, req: &VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.lock();
        let was_leader = state.is_leader();
        let (last_index, last_term) = self.log.last_position();

        let (resp, dirty) = state.handle_vote(req, last_index, last_term);
        if dirty {
            self.persist(&state)?;
        }
        if was_leader && !state.is_leader() {
            self.leadership_lost(&state);
        }

        if resp.granted {
            self.metrics.votes_granted.inc();
            debug!(
                "Server {} granted vote to {} for term {}",
                self.server_id, req.candidate_id, req.candidate_term
            );
        } else {
            self.metrics.votes_rejected.inc();
        }
        Ok(resp)
    }

    /// ReplicateLog RPC (append or heartbeat)
    pub fn handle_replicate(&self, req: &ReplicateRequest) -> Result<ReplicateResponse> {
        self.ensure_running()?;
        let result = self.replicate_locked(req);
        self.check_fatal(result)
    }

    fn reject(&self, state: &ConsensusState, req: &ReplicateRequest, why: Rejection) -> ReplicateResponse {
        self.metrics.append_rejections.inc();
        debug!(
            "Server {} rejected index {} (prev {}/{}) from leader {}: {}",
            self.server_id, req.index, req.prev_index, req.prev_term, req.leader_id, why
        );
        ReplicateResponse::rejected(state.term(), why)
    }

    fn replicate_locked(&self, req: &ReplicateRequest) -> Result<ReplicateResponse> {
        let mut state = self.state.lock();
        let was_leader = state.is_leader();

        match state.admit_leader(req.leader_term, req.leader_id) {
            Admission::Stale => return Ok(self.reject(&state, req, Rejection::StaleTerm)),
            Admission::Admitted { term_changed } => {
                if term_changed {
                    self.persist(&state)?;
                }
            }
        }
        if was_leader {
            self.leadership_lost(&state);
        }

        if req.is_heartbeat() {
            let target = req.leader_commit.min(self.log.last_index());
            self.commit_and_apply(&mut state, target)?;
            return Ok(ReplicateResponse::accepted(state.term()));
        }

        if req.sql.is_empty() || req.index == 0 || req.index != req.prev_index + 1 {
            warn!(
                "Server {} got malformed replicate request from {}: index {}, prev {}, {} bytes",
                self.server_id,
                req.leader_id,
                req.index,
                req.prev_index,
                req.sql.len()
            );
            return Ok(self.reject(&state, req, Rejection::Malformed));
        }

        match self.log.term_at(req.prev_index) {
            None => return Ok(self.reject(&state, req, Rejection::MissingPrev)),
            Some(term) if term != req.prev_term => {
                return Ok(self.reject(&state, req, Rejection::PrevTermConflict))
            }
            Some(_) => {}
        }

        match self.log.get(req.index) {
            Some(existing) if existing.term == req.term => {
                debug!("Server {} already holds index {}", self.server_id, req.index);
            }
            Some(existing) => {
                if req.index <= state.commit_index() {
                    warn!(
                        "Server {} refusing to overwrite committed index {} (term {} -> {})",
                        self.server_id, req.index, existing.term, req.term
                    );
                    return Ok(self.reject(&state, req, Rejection::CommittedConflict));
                }
                let removed = self.log.truncate_from(req.index)?;
                self.metrics.entries_truncated.add(removed);
                info!(
                    "Server {} dropped {} conflicting records from index {} (term {} -> {})",
                    self.server_id, removed, req.index, existing.term, req.term
                );
                self.append_from(req)?;
            }
            None => self.append_from(req)?,
        }

        self.commit_and_apply(&mut state, req.leader_commit.min(req.index))?;
        Ok(ReplicateResponse::accepted(state.term()))
    }

    fn append_from(&self, req: &ReplicateRequest) -> Result<()> {
        self.log.append(LogRecord::new(
            req.index,
            req.term,
            req.sql.clone(),
            req.fed_index,
        ))?;
        self.metrics.entries_appended.inc();
        Ok(())
    }

    // === Commit & apply ===

    fn commit_and_apply(&self, state: &mut ConsensusState, target: u64) -> Result<()> {
        let target = target.min(self.log.last_index());
        if state.advance_commit(target) {
            self.metrics.commit_index.set(target);
            debug!("Server {} commit index -> {}", self.server_id, target);
        }
        self.apply_committed(state.commit_index(), state.is_leader())
    }

    /// Apply every committed, unapplied record in index order
    fn apply_committed(&self, commit: u64, leader: bool) -> Result<()> {
        let from = self.log.applied_index() + 1;
        for record in self.log.iter_from(from) {
            if record.index > commit {
                break;
            }
            if !record.applied {
                self.apply_record(&record, leader)?;
                self.log.mark_applied(record.index)?;
                self.metrics.entries_applied.inc();
            }
            self.applied_tx.send_replace(record.index);
        }
        Ok(())
    }

    fn apply_record(&self, record: &LogRecord, leader: bool) -> Result<()> {
        if record.sql == LEADER_NOOP {
            return Ok(());
        }
        let fed_log = self.fed_log.as_ref().filter(|_| record.fed_index > 0);

        if let Some(fed_log) = fed_log {
            if record.fed_index <= fed_log.last_index() {
                debug!(
                    "Server {} skipping federated record {} at index {}: already applied",
                    self.server_id, record.fed_index, record.index
                );
                return Ok(());
            }
        }

        if let Some(change) = MembershipChange::parse(&record.sql) {
            let members_before = self.directory.len(self.zone_id);
            self.directory.apply(&change)?;
            if leader {
                self.track_membership(&change, members_before, record.index);
            }
        }
        self.applier.apply(record.index, &record.sql)?;

        if let Some(fed_log) = fed_log {
            let expected = fed_log.last_index() + 1;
            if record.fed_index == expected {
                fed_log.append_applied_if_absent(LogRecord::new(
                    record.fed_index,
                    record.term,
                    record.sql.clone(),
                    record.fed_index,
                ))?;
            } else {
                warn!(
                    "Server {} federated record {} does not follow cursor {}",
                    self.server_id,
                    record.fed_index,
                    expected - 1
                );
            }
        }
        Ok(())
    }

    /// Wait until `index` has been applied locally
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.applied_tx.subscribe();
        let res = tokio::time::timeout(timeout, rx.wait_for(|&applied| applied >= index))
            .await
            .map(|r| r.map(|_| ()));
        match res {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Internal("applied index channel closed".into())),
            Err(_) if self.is_halted() => Err(Error::Halted),
            Err(_) => Err(Error::ConsensusTimeout),
        }
    }

    /// Wait until every server in `peers` holds `index`
    pub async fn wait_replicated(
        &self,
        index: u64,
        peers: &[ServerId],
        timeout: Duration,
    ) -> Result<()> {
        let mut rx = self.replicated_tx.subscribe();
        let replicated = rx.wait_for(|matched| {
            peers
                .iter()
                .all(|id| matched.get(id).map_or(false, |&m| m >= index))
        });
        let res = tokio::time::timeout(timeout, replicated)
            .await
            .map(|r| r.map(|_| ()));
        match res {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Internal("replication channel closed".into())),
            Err(_) => Err(Error::Timeout(format!(
                "index {} not replicated to {:?} within {:?}",
                index, peers, timeout
            ))),
        }
    }

    // === Leader side ===

    fn next_fed_index(&self) -> u64 {
        let cursor = self.fed_log.as_ref().map(|l| l.last_index()).unwrap_or(0);
        cursor.max(self.log.last_fed_index()) + 1
    }

    /// Append `sql` on the leader and wait until it is applied here.
    /// Returns the record's index.
    pub async fn replicate(&self, sql: &str, tag: FedTag) -> Result<u64> {
        self.ensure_running()?;
        if sql.is_empty() {
            return Err(Error::Malformed("empty command".into()));
        }

        let (index, term) = {
            let state = self.state.lock();
            if !state.is_leader() {
                return Err(self.not_leader(&state));
            }
            let fed_index = match tag {
                FedTag::None => 0,
                FedTag::Assign(fed_index) => fed_index,
                FedTag::Next => self.next_fed_index(),
            };
            let index = self.log.last_index() + 1;
            let appended = self
                .log
                .append(LogRecord::new(index, state.term(), sql, fed_index));
            self.check_fatal(appended)?;
            self.metrics.entries_appended.inc();
            (index, state.term())
        };
        debug!(
            "Server {} appended index {} in term {}",
            self.server_id, index, term
        );

        let advanced = self.advance_leader_commit();
        self.check_fatal(advanced)?;
        self.wake.notify_one();

        self.wait_applied(index, self.config.replicate_timeout())
            .await?;

        match self.log.term_at(index) {
            Some(t) if t == term => Ok(index),
            _ => Err(self.not_leader(&self.state.lock())),
        }
    }

    /// Commit the highest current-term index held by a majority
    fn advance_leader_commit(&self) -> Result<()> {
        let last = self.log.last_index();
        let matched: HashMap<ServerId, u64> = self
            .followers
            .lock()
            .iter()
            .map(|(&id, p)| (id, p.match_index))
            .collect();

        let mut indexes: Vec<u64> = matched.values().copied().collect();
        indexes.push(last);
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = indexes[quorum(indexes.len()) - 1];

        {
            let mut state = self.state.lock();
            if state.is_leader()
                && candidate > state.commit_index()
                && self.log.term_at(candidate) == Some(state.term())
            {
                self.commit_and_apply(&mut state, candidate)?;
            }
        }

        self.admit_pending_joins(&matched);
        self.replicated_tx.send_replace(matched);
        Ok(())
    }

    /// Follow a committed membership change on the leader. Runs under the
    /// state lock.
    fn track_membership(&self, change: &MembershipChange, members_before: usize, index: u64) {
        match change {
            MembershipChange::Add(server) if server.zone_id == self.zone_id => {
                if members_before == 2 {
                    self.pending_joins.lock().push((server.id, index));
                } else {
                    self.track_follower(server.id);
                }
            }
            MembershipChange::Delete { zone_id, server_id } if *zone_id == self.zone_id => {
                self.pending_joins.lock().retain(|&(id, _)| id != *server_id);
                if self.followers.lock().remove(server_id).is_some() {
                    info!("Server {} stopped replicating to {}", self.server_id, server_id);
                }
            }
            _ => {}
        }
    }

    fn track_follower(&self, server_id: ServerId) {
        if server_id == self.server_id {
            return;
        }
        let next = self.log.last_index() + 1;
        self.followers
            .lock()
            .entry(server_id)
            .or_insert_with(|| FollowerProgress::new(next));
        info!("Server {} now replicating to {}", self.server_id, server_id);
        self.wake.notify_one();
    }

    /// Track joining servers whose `Add` every existing follower holds
    fn admit_pending_joins(&self, matched: &HashMap<ServerId, u64>) {
        let ready: Vec<ServerId> = {
            let mut pending = self.pending_joins.lock();
            if pending.is_empty() {
                return;
            }
            let mut ready = Vec::new();
            pending.retain(|&(id, index)| {
                if matched.values().all(|&m| m >= index) {
                    ready.push(id);
                    false
                } else {
                    true
                }
            });
            ready
        };
        if ready.is_empty() || !self.state.lock().is_leader() {
            return;
        }
        for id in ready {
            self.track_follower(id);
        }
    }

    /// Forget what we know about a follower's log so matching restarts from our last index
    pub fn reset_follower(&self, server_id: ServerId) -> Result<()> {
        let state = self.state.lock();
        if !state.is_leader() {
            return Err(self.not_leader(&state));
        }
        let next = self.log.last_index() + 1;
        match self.followers.lock().get_mut(&server_id) {
            Some(progress) => {
                progress.next_index = next;
                progress.match_index = 0;
            }
            None => {
                return Err(Error::Membership(format!(
                    "server {} is not a follower of this leader",
                    server_id
                )))
            }
        }
        info!(
            "Server {} reset follower {} to next index {}",
            self.server_id, server_id, next
        );
        Ok(())
    }

    fn sync_followers(self: &Arc<Self>) {
        if !self.state.lock().is_leader() {
            return;
        }
        let last = self.log.last_index();
        let ready: Vec<ServerId> = self
            .followers
            .lock()
            .iter_mut()
            .filter(|(_, p)| !p.in_flight && p.next_index <= last)
            .map(|(id, p)| {
                p.in_flight = true;
                *id
            })
            .collect();

        for peer in ready {
            let raft = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = raft.replicate_to(peer).await;
                if let Some(progress) = raft.followers.lock().get_mut(&peer) {
                    progress.in_flight = false;
                }
                if let Err(e) = raft.check_fatal(outcome) {
                    debug!("replication to {} stopped: {}", peer, e);
                }
            });
        }
    }

    /// Ship records to one follower until it is caught up or unreachable
    async fn replicate_to(&self, peer: ServerId) -> Result<()> {
        loop {
            let Some(endpoint) = self.directory.endpoint(self.zone_id, peer) else {
                return Ok(());
            };

            let (req, term) = {
                let state = self.state.lock();
                if !state.is_leader() {
                    return Ok(());
                }
                let next = match self.followers.lock().get(&peer) {
                    Some(p) => p.next_index,
                    None => return Ok(()),
                };
                let Some(record) = self.log.get(next) else {
                    return Ok(());
                };
                let prev_index = next - 1;
                let Some(prev_term) = self.log.term_at(prev_index) else {
                    return Ok(());
                };
                let req = ReplicateRequest {
                    leader_id: self.server_id,
                    leader_commit: state.commit_index(),
                    leader_term: state.term(),
                    index: record.index,
                    term: record.term,
                    prev_index,
                    prev_term,
                    fed_index: record.fed_index,
                    sql: record.sql,
                };
                (req, state.term())
            };
            let index = req.index;

            let started = Instant::now();
            let result = tokio::time::timeout(
                self.config.rpc_timeout(),
                self.transport.replicate_log(&endpoint, req),
            )
            .await;
            self.metrics.observe_rpc(started.elapsed());

            let resp = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => {
                    debug!("replicate index {} to {} failed: {}", index, peer, e);
                    return Ok(());
                }
                Err(_) => {
                    debug!("replicate index {} to {} timed out", index, peer);
                    return Ok(());
                }
            };

            if resp.term > term {
                return self.observe_higher_term(resp.term);
            }

            if resp.success {
                if let Some(p) = self.followers.lock().get_mut(&peer) {
                    p.match_index = p.match_index.max(index);
                    p.next_index = p.next_index.max(index + 1);
                }
                self.advance_leader_commit()?;
                continue;
            }

            match resp.rejection {
                Some(why) if !why.is_inconsistency() => {
                    warn!("follower {} refused index {}: {}", peer, index, why);
                    return Ok(());
                }
                _ => {
                    if let Some(p) = self.followers.lock().get_mut(&peer) {
                        if p.next_index == index && index > 1 {
                            p.next_index = index - 1;
                        }
                    }
                    debug!("follower {} diverges before {}, backing off", peer, index);
                }
            }
        }
    }

    fn broadcast_heartbeat(self: &Arc<Self>) {
        let (term, commit) = {
            let state = self.state.lock();
            if !state.is_leader() {
                return;
            }
            (state.term(), state.commit_index())
        };

        let targets: Vec<(ServerId, u64)> = self
            .followers
            .lock()
            .iter()
            .map(|(id, p)| (*id, p.match_index))
            .collect();

        for (peer, matched) in targets {
            let Some(endpoint) = self.directory.endpoint(self.zone_id, peer) else {
                continue;
            };
            // never let a heartbeat commit past what this follower is known to hold
            let req = ReplicateRequest::heartbeat(self.server_id, term, commit.min(matched));
            let raft = Arc::clone(self);

            tokio::spawn(async move {
                raft.metrics.heartbeats_sent.inc();
                let started = Instant::now();
                let result = tokio::time::timeout(
                    raft.config.rpc_timeout(),
                    raft.transport.replicate_log(&endpoint, req),
                )
                .await;
                raft.metrics.observe_rpc(started.elapsed());

                match result {
                    Ok(Ok(resp)) if resp.term > term => {
                        let observed = raft.observe_higher_term(resp.term);
                        if let Err(e) = raft.check_fatal(observed) {
                            warn!("failed to adopt term {}: {}", resp.term, e);
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        raft.metrics.heartbeat_failures.inc();
                        debug!("heartbeat to {} failed: {}", peer, e);
                    }
                    Err(_) => {
                        raft.metrics.heartbeat_failures.inc();
                        debug!("heartbeat to {} timed out", peer);
                    }
                }
            });
        }
    }

    // === Elections ===

    async fn start_election(&self) -> Result<()> {
        let (req, term) = {
            let mut state = self.state.lock();
            if state.is_leader() {
                return Ok(());
            }
            let (last_index, last_term) = self.log.last_position();
            let req = state.become_candidate(last_index, last_term);
            self.persist(&state)?;
            (req, state.term())
        };
        self.metrics.elections_started.inc();

        let peers = self.directory.peers(self.zone_id, self.server_id);
        let needed = quorum(peers.len() + 1);
        info!(
            "Server {} starting election for term {} ({} votes needed)",
            self.server_id, term, needed
        );

        let rpc_timeout = self.config.rpc_timeout();
        let mut pending: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let transport = Arc::clone(&self.transport);
                let req = req.clone();
                async move {
                    let started = Instant::now();
                    let result =
                        tokio::time::timeout(rpc_timeout, transport.request_vote(&peer.endpoint, req))
                            .await;
                    (peer.id, started.elapsed(), result)
                }
            })
            .collect();

        let mut votes = 1;
        while votes < needed {
            let Some((peer, elapsed, result)) = pending.next().await else {
                break;
            };
            self.metrics.observe_rpc(elapsed);
            match result {
                Ok(Ok(resp)) if resp.term > term => return self.observe_higher_term(resp.term),
                Ok(Ok(resp)) if resp.granted => {
                    votes += 1;
                    debug!("Server {} got vote from {} for term {}", self.server_id, peer, term);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("vote request to {} failed: {}", peer, e),
                Err(_) => debug!("vote request to {} timed out", peer),
            }
        }

        if votes >= needed {
            self.win_election(term)?;
        } else {
            debug!(
                "Server {} did not win term {} ({}/{} votes)",
                self.server_id, term, votes, needed
            );
        }
        Ok(())
    }

    fn win_election(&self, term: u32) -> Result<()> {
        let mut state = self.state.lock();
        if !state.become_leader(term) {
            return Ok(());
        }

        let next = self.log.last_index() + 1;
        {
            let mut followers = self.followers.lock();
            followers.clear();
            for peer in self.directory.peers(self.zone_id, self.server_id) {
                followers.insert(peer.id, FollowerProgress::new(next));
            }
        }
        self.pending_joins.lock().clear();

        // earlier-term records only commit behind one from this term
        let last = next - 1;
        if last > state.commit_index() {
            let appended = self
                .log
                .append(LogRecord::new(last + 1, term, LEADER_NOOP, 0));
            self.check_fatal(appended)?;
            self.metrics.entries_appended.inc();
        }

        self.metrics.elections_won.inc();
        info!("Server {} became leader for term {}", self.server_id, term);
        self.audit.log_event(
            AuditEventType::LeadershipAcquired,
            format!("server/{}", self.server_id),
            None,
            format!("term {}", term),
            None,
        );
        drop(state);
        self.wake.notify_one();
        self.advance_leader_commit()
    }
}

#[tonic::async_trait]
impl FedSink for RaftManager {
    fn is_leader(&self) -> bool {
        RaftManager::is_leader(self)
    }

    fn leader_hint(&self) -> Option<ServerId> {
        self.leader_id()
    }

    async fn submit_federated(&self, fed_index: u64, sql: &str) -> Result<u64> {
        self.replicate(sql, FedTag::Assign(fed_index)).await
    }
}

/// Start the election/heartbeat loop. Resolves with `Err(Halted)` when the
/// server stops after a storage failure, `Ok` after [`RaftManager::shutdown`].
pub fn start_raft_tasks(raft: Arc<RaftManager>) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let tick = raft.config.tick();
        let heartbeat_interval = raft.config.heartbeat_interval();
        let sync_interval = raft.config.wal_sync_interval();
        let mut last_heartbeat: Option<Instant> = None;
        let mut last_sync = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = raft.wake.notified() => {}
            }

            if raft.is_halted() {
                return Err(Error::Halted);
            }
            if raft.stopped.load(Ordering::SeqCst) {
                info!("Server {} raft loop stopped", raft.server_id);
                return Ok(());
            }

            if last_sync.elapsed() >= sync_interval {
                if let Err(e) = raft.sync_logs() {
                    raft.halt(&e);
                    return Err(e);
                }
                last_sync = Instant::now();
            }

            let (leader, election_due) = {
                let state = raft.state.lock();
                (state.is_leader(), state.election_due())
            };

            if leader {
                if last_heartbeat.map_or(true, |t| t.elapsed() >= heartbeat_interval) {
                    raft.broadcast_heartbeat();
                    last_heartbeat = Some(Instant::now());
                }
                raft.sync_followers();
            } else {
                last_heartbeat = None;
                if election_due {
                    if let Err(e) = raft.start_election().await {
                        if e.is_fatal() {
                            raft.halt(&e);
                            return Err(e);
                        }
                        warn!("Server {} election failed: {}", raft.server_id, e);
                    }
                }
            }
        }
    })
}
