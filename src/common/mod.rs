//! Common utilities and types shared across zonelog

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod raft;
pub mod utils;

pub use audit::{AuditEventType, AuditLogger};
pub use auth::{AuthResult, Authenticator, Principal};
pub use config::{
    AuthConfig, Config, FederationConfig, FederationMode, PeerConfig, RaftConfig,
    SlaveZoneConfig, WalSyncPolicy,
};
pub use error::{Error, Result};
pub use metrics::RaftMetrics;
pub use raft::{RaftRole, ServerId, ZoneId};
pub use utils::{crc32, quorum, random_duration, timestamp_now};
