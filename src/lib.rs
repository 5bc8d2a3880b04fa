//! # zonelog
//!
//! Replicated control-plane log for zone servers:
//! - Raft-style leader election and log replication inside a zone
//! - Write-ahead log with torn-tail recovery for durability
//! - One-way federation shipping from a master zone to slave zones
//! - gRPC between servers, HTTP for the admin API
//!
//! ## Architecture
//!
//! ```text
//!          master zone                         slave zone
//! ┌────────────────────────────┐      ┌────────────────────────────┐
//! │ leader ── ReplicateLog ──▶ │      │ leader ── ReplicateLog ──▶ │
//! │   │       followers        │      │   ▲       followers        │
//! │   │ federation log         │      │   │ federation cursor      │
//! └───┼────────────────────────┘      └───┼────────────────────────┘
//!     └──────── ReplicateFedLog ──────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a zone server
//! ```bash
//! zonelog-server serve \
//!   --config zone0.toml \
//!   --server-id 0 \
//!   --data-dir ./zs0-data
//! ```
//!
//! ### Use the CLI
//! ```bash
//! zonelog status --url http://localhost:2633
//! zonelog exec "INSERT INTO vms VALUES (1)" --token $ZONELOG_ADMIN_TOKEN
//! zonelog add-server --zone 0 --endpoint http://10.0.0.4:2634
//! zonelog reset-server --zone 0 --server 3
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod consensus;
pub mod federation;
pub mod log;
pub mod rpc;
pub mod zone;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use consensus::RaftManager;
pub use zone::{ServerContext, ZoneServerNode};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("zonelog");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
