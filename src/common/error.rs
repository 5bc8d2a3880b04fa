//! Error types for zonelog

use crate::common::raft::{ServerId, ZoneId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Metadata store error: {0}")]
    Metadata(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // === Consensus Errors ===
    #[error("Stale term {term}: current term is {current}")]
    StaleTerm { term: u32, current: u32 },

    #[error("Log inconsistency at index {index}: {reason}")]
    LogInconsistency { index: u64, reason: String },

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Not leader: current leader is {}", display_leader(.leader))]
    NotLeader { leader: Option<ServerId>, endpoint: Option<String> },

    #[error("Consensus timeout")]
    ConsensusTimeout,

    #[error("Server halted after a storage failure")]
    Halted,

    // === Access Errors ===
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server is running in cache mode and holds no replicated log")]
    CacheMode,

    #[error("Unavailable: {0}")]
    Unavailable(String),

    // === Membership / Federation Errors ===
    #[error("Zone {requested} is not served here (local zone {local}); send the request to a server of zone {requested}")]
    MembershipRedirect { requested: ZoneId, local: ZoneId },

    #[error("Membership error: {0}")]
    Membership(String),

    #[error("Federation error: {0}")]
    Federation(String),

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

fn display_leader(leader: &Option<ServerId>) -> String {
    leader
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConsensusTimeout
                | Error::NotLeader { .. }
                | Error::Unavailable(_)
                | Error::Transport(_)
        )
    }

    /// Storage failures that break the ability to persist the log.
    /// A server hitting one of these must stop participating.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Wal(_)
                | Error::Corrupted(_)
                | Error::Metadata(_)
                | Error::Serialization(_)
                | Error::Halted
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::NotLeader { .. } => tonic::Status::new(Code::FailedPrecondition, self.to_string()),
            Error::Malformed(_) | Error::InvalidConfig(_) => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::Unauthorized(_) => tonic::Status::new(Code::PermissionDenied, self.to_string()),
            Error::CacheMode | Error::Unavailable(_) | Error::Halted => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::MembershipRedirect { .. } | Error::Federation(_) | Error::Membership(_) => {
                tonic::Status::new(Code::FailedPrecondition, self.to_string())
            }
            Error::ConsensusTimeout | Error::Timeout(_) => {
                tonic::Status::new(Code::DeadlineExceeded, self.to_string())
            }
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotLeader { .. } => StatusCode::TEMPORARY_REDIRECT,
            Error::Malformed(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::MembershipRedirect { .. } | Error::Membership(_) | Error::Federation(_) => {
                StatusCode::CONFLICT
            }
            Error::Timeout(_) | Error::ConsensusTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::CacheMode | Error::Unavailable(_) | Error::Halted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
