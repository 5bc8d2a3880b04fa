//! Per-server election bookkeeping
//!
//! `ConsensusState` holds role, term, vote and commit position for one server
//! and decides votes and term transitions. It performs no I/O: callers persist
//! [`HardState`] whenever a method reports that it changed, and own the lock
//! around it.

use crate::common::raft::{RaftRole, ServerId, VoteRequest, VoteResponse};
use crate::common::random_duration;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// The part of the consensus state that must survive restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u32,
    pub voted_for: Option<ServerId>,
}

/// Result of the term gate applied to replication requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Sender is behind our term
    Stale,
    /// Sender is the legitimate leader; `term_changed` means hard state moved
    Admitted { term_changed: bool },
}

#[derive(Debug)]
pub struct ConsensusState {
    server_id: ServerId,
    term: u32,
    role: RaftRole,
    voted_for: Option<ServerId>,
    leader_id: Option<ServerId>,
    commit_index: u64,
    last_heartbeat: Instant,
    election_timeout: Duration,
    timeout_bounds: (Duration, Duration),
}

impl ConsensusState {
    /// Always starts as a follower, whatever the persisted state says
    pub fn new(server_id: ServerId, hard: HardState, timeout_bounds: (Duration, Duration)) -> Self {
        Self {
            server_id,
            term: hard.term,
            role: RaftRole::Follower,
            voted_for: hard.voted_for,
            leader_id: None,
            commit_index: 0,
            last_heartbeat: Instant::now(),
            election_timeout: random_duration(timeout_bounds.0, timeout_bounds.1),
            timeout_bounds,
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn term(&self) -> u32 {
        self.term
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<ServerId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for,
        }
    }

    /// Adopt a strictly greater term and fall back to follower.
    /// Returns whether the term moved.
    pub fn observe_term(&mut self, term: u32) -> bool {
        if term <= self.term {
            return false;
        }
        if self.role != RaftRole::Follower {
            tracing::info!(
                "server {} stepping down: term {} -> {}",
                self.server_id,
                self.term,
                term
            );
        }
        self.term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.role = RaftRole::Follower;
        true
    }

    /// Decide a vote request against our log position `(last_index, last_term)`.
    /// The boolean is true when hard state changed and must be persisted
    /// before the response leaves the server.
    pub fn handle_vote(
        &mut self,
        req: &VoteRequest,
        last_index: u64,
        last_term: u32,
    ) -> (VoteResponse, bool) {
        if req.candidate_term < self.term {
            return (self.vote_response(false), false);
        }

        let mut dirty = self.observe_term(req.candidate_term);

        let ours_newer = last_term > req.candidate_log_term
            || (last_term == req.candidate_log_term && last_index > req.candidate_log_index);
        if ours_newer {
            tracing::debug!(
                "refusing vote for {}: local log ({}, {}) is ahead of ({}, {})",
                req.candidate_id,
                last_index,
                last_term,
                req.candidate_log_index,
                req.candidate_log_term
            );
            return (self.vote_response(false), dirty);
        }

        if let Some(voted) = self.voted_for {
            if voted != req.candidate_id {
                return (self.vote_response(false), dirty);
            }
        }

        if self.voted_for.is_none() {
            self.voted_for = Some(req.candidate_id);
            dirty = true;
        }
        self.reset_election_timer();
        (self.vote_response(true), dirty)
    }

    fn vote_response(&self, granted: bool) -> VoteResponse {
        VoteResponse {
            granted,
            term: self.term,
        }
    }

    /// Term gate for append/heartbeat. On admission the sender becomes our
    /// known leader, a same-term candidate steps down and the election timer
    /// is reset.
    pub fn admit_leader(&mut self, leader_term: u32, leader_id: ServerId) -> Admission {
        if leader_term < self.term {
            return Admission::Stale;
        }
        let term_changed = self.observe_term(leader_term);
        if self.role != RaftRole::Follower {
            tracing::info!(
                "server {} ({}) yields to leader {} in term {}",
                self.server_id,
                self.role,
                leader_id,
                self.term
            );
            self.role = RaftRole::Follower;
        }
        self.leader_id = Some(leader_id);
        self.record_heartbeat();
        Admission::Admitted { term_changed }
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Record a heartbeat and draw a fresh randomized timeout
    pub fn reset_election_timer(&mut self) {
        self.last_heartbeat = Instant::now();
        self.election_timeout = random_duration(self.timeout_bounds.0, self.timeout_bounds.1);
    }

    pub fn election_due(&self) -> bool {
        self.role != RaftRole::Leader && self.last_heartbeat.elapsed() >= self.election_timeout
    }

    /// Start a new election: next term, vote for ourselves, fresh timeout
    pub fn become_candidate(&mut self, last_index: u64, last_term: u32) -> VoteRequest {
        self.term += 1;
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.server_id);
        self.leader_id = None;
        self.reset_election_timer();

        VoteRequest {
            candidate_term: self.term,
            candidate_id: self.server_id,
            candidate_log_index: last_index,
            candidate_log_term: last_term,
        }
    }

    /// Only a candidate still in `term` can win it
    pub fn become_leader(&mut self, term: u32) -> bool {
        if self.role != RaftRole::Candidate || self.term != term {
            return false;
        }
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.server_id);
        true
    }

    /// Move the commit index forward. Lower values are ignored.
    pub fn advance_commit(&mut self, to: u64) -> bool {
        if to > self.commit_index {
            self.commit_index = to;
            true
        } else {
            false
        }
    }
}
