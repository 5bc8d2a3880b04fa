//! Message types exchanged between zone servers
//!
//! These are transport-neutral: the gRPC layer converts them to and from the
//! generated protobuf structs, the in-process network passes them as-is.

use serde::{Deserialize, Serialize};

pub type ServerId = i32;
pub type ZoneId = i32;

/// Server role in the election state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

impl std::str::FromStr for RaftRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "follower" => Ok(RaftRole::Follower),
            "candidate" => Ok(RaftRole::Candidate),
            "leader" => Ok(RaftRole::Leader),
            other => Err(crate::Error::Malformed(format!("unknown role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_term: u32,
    pub candidate_id: ServerId,
    pub candidate_log_index: u64,
    pub candidate_log_term: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub granted: bool,
    pub term: u32,
}

/// Append/heartbeat request. A heartbeat carries `index == 0`,
/// `prev_index == 0`, `term == 0` and an empty `sql`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub leader_id: ServerId,
    pub leader_commit: u64,
    pub leader_term: u32,
    pub index: u64,
    pub term: u32,
    pub prev_index: u64,
    pub prev_term: u32,
    pub fed_index: u64,
    pub sql: String,
}

impl ReplicateRequest {
    pub fn heartbeat(leader_id: ServerId, leader_term: u32, leader_commit: u64) -> Self {
        Self {
            leader_id,
            leader_commit,
            leader_term,
            index: 0,
            term: 0,
            prev_index: 0,
            prev_term: 0,
            fed_index: 0,
            sql: String::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.index == 0 && self.prev_index == 0 && self.term == 0 && self.sql.is_empty()
    }
}

/// Why a follower refused a replication request. Stale-term and
/// log-inconsistency rejections share the `(success, term)` reply but need
/// different handling on the leader, so they stay distinct here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// The sender's term is behind ours
    StaleTerm,
    /// No local record at `prev_index`
    MissingPrev,
    /// Local record at `prev_index` has another term
    PrevTermConflict,
    /// Request shape is invalid (e.g. empty command at a non-zero index)
    Malformed,
    /// The request would overwrite an already committed record
    CommittedConflict,
}

impl Rejection {
    /// Leader should back off `next_index` and resend
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, Rejection::MissingPrev | Rejection::PrevTermConflict)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::StaleTerm => write!(f, "stale term"),
            Rejection::MissingPrev => write!(f, "missing previous record"),
            Rejection::PrevTermConflict => write!(f, "previous record term mismatch"),
            Rejection::Malformed => write!(f, "malformed request"),
            Rejection::CommittedConflict => write!(f, "conflict with committed record"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub success: bool,
    pub term: u32,
    pub rejection: Option<Rejection>,
}

impl ReplicateResponse {
    pub fn accepted(term: u32) -> Self {
        Self {
            success: true,
            term,
            rejection: None,
        }
    }

    pub fn rejected(term: u32, rejection: Rejection) -> Self {
        Self {
            success: false,
            term,
            rejection: Some(rejection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FedReplicateRequest {
    pub index: u64,
    pub prev: u64,
    pub sql: String,
}

/// `resume_index` is only meaningful when `success` is false:
/// [`FED_FAILURE`] marks a hard failure, anything else asks the master to
/// resend starting after that index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FedReplicateResponse {
    pub success: bool,
    pub resume_index: u64,
}

/// Hard-failure sentinel of the federation reply convention
pub const FED_FAILURE: u64 = u64::MAX;

impl FedReplicateResponse {
    pub fn applied() -> Self {
        Self {
            success: true,
            resume_index: 0,
        }
    }

    pub fn resend(last_index: u64) -> Self {
        Self {
            success: false,
            resume_index: last_index,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            resume_index: FED_FAILURE,
        }
    }
}

/// Snapshot of one server's consensus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub server_id: ServerId,
    pub zone_id: ZoneId,
    pub term: u32,
    pub role: RaftRole,
    pub leader_id: Option<ServerId>,
    pub commit_index: u64,
    #[serde(rename = "votedfor")]
    pub voted_for: Option<ServerId>,
    pub last_log_index: u64,
    pub last_log_term: u32,
    pub applied_index: u64,
    pub fed_cursor: u64,
    pub halted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_shape() {
        let hb = ReplicateRequest::heartbeat(1, 4, 10);
        assert!(hb.is_heartbeat());

        let entry = ReplicateRequest {
            index: 1,
            term: 4,
            sql: "INSERT A".into(),
            ..hb
        };
        assert!(!entry.is_heartbeat());
    }

    #[test]
    fn test_rejection_kinds() {
        assert!(Rejection::MissingPrev.is_inconsistency());
        assert!(Rejection::PrevTermConflict.is_inconsistency());
        assert!(!Rejection::StaleTerm.is_inconsistency());
        assert!(!Rejection::Malformed.is_inconsistency());
    }

    #[test]
    fn test_status_json_uses_votedfor() {
        let status = RaftStatus {
            server_id: 0,
            zone_id: 0,
            term: 3,
            role: RaftRole::Leader,
            leader_id: Some(0),
            commit_index: 7,
            voted_for: Some(0),
            last_log_index: 7,
            last_log_term: 3,
            applied_index: 7,
            fed_cursor: 0,
            halted: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["votedfor"], 0);
        assert_eq!(json["role"], "leader");
    }
}
