//! Configuration for zone servers
//!
//! Loaded from an optional TOML file, then `ZONELOG__*` environment
//! variables (e.g. `ZONELOG__RAFT__HEARTBEAT_INTERVAL_MS=200`). The server
//! binary applies CLI flags on top.

use crate::common::raft::{ServerId, ZoneId};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server ID inside the zone
    pub server_id: ServerId,

    /// Zone this server belongs to
    pub zone_id: ZoneId,

    /// Endpoint other servers use to reach this one (gRPC URL)
    pub endpoint: String,

    /// Bind address for internal gRPC
    pub grpc_addr: SocketAddr,

    /// Bind address for the HTTP admin API
    pub http_addr: SocketAddr,

    /// Log, metadata and applied-state directory
    pub data_dir: PathBuf,

    /// Initial zone servers, used only when the directory is empty
    pub peers: Vec<PeerConfig>,

    /// Cache-only replica: holds no log and rejects every consensus call
    pub cache: bool,

    pub wal_sync: WalSyncPolicy,

    pub raft: RaftConfig,

    pub federation: FederationConfig,

    pub auth: AuthConfig,

    /// Logging level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: 0,
            zone_id: 0,
            endpoint: "http://127.0.0.1:2634".to_string(),
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], 2634)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 2633)),
            data_dir: PathBuf::from("./zone-data"),
            peers: Vec::new(),
            cache: false,
            wal_sync: WalSyncPolicy::Always,
            raft: RaftConfig::default(),
            federation: FederationConfig::default(),
            auth: AuthConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A zone server known at bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: ServerId,
    #[serde(default)]
    pub name: String,
    pub endpoint: String,
}

/// WAL fsync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// fsync after every frame
    Always,
    /// flush to the OS after every frame
    Interval,
    /// leave buffering to the writer
    Never,
}

/// Election and replication timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat interval
    pub heartbeat_interval_ms: u64,

    /// Timeout of a single outbound vote/replicate call
    pub rpc_timeout_ms: u64,

    /// How long a client write waits to be committed and applied
    pub replicate_timeout_ms: u64,

    /// Upper bound of the wait for a membership change to reach followers
    pub membership_wait_ms: u64,

    /// Granularity of the background timer loop
    pub tick_ms: u64,

    /// fsync period for logs opened with `wal_sync = "interval"`
    pub wal_sync_interval_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            heartbeat_interval_ms: 300,
            rpc_timeout_ms: 250,
            replicate_timeout_ms: 5000,
            membership_wait_ms: 10_000,
            tick_ms: 50,
            wal_sync_interval_ms: 1000,
        }
    }
}

impl RaftConfig {
    pub fn election_timeout_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn replicate_timeout(&self) -> Duration {
        Duration::from_millis(self.replicate_timeout_ms)
    }

    pub fn membership_wait(&self) -> Duration {
        Duration::from_millis(self.membership_wait_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn wal_sync_interval(&self) -> Duration {
        Duration::from_millis(self.wal_sync_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FederationMode {
    Standalone,
    Master,
    Slave,
}

/// A slave zone the master ships its federation log to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveZoneConfig {
    pub zone_id: ZoneId,
    /// Servers of the slave zone, tried in order until one accepts
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub mode: FederationMode,

    /// Zone id of the federation master (slaves only)
    pub master_zone_id: Option<ZoneId>,

    /// Slave zones (master only)
    pub slaves: Vec<SlaveZoneConfig>,

    /// Interval between shipping rounds
    pub ship_interval_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            mode: FederationMode::Standalone,
            master_zone_id: None,
            slaves: Vec::new(),
            ship_interval_ms: 500,
        }
    }
}

impl FederationConfig {
    pub fn ship_interval(&self) -> Duration {
        Duration::from_millis(self.ship_interval_ms)
    }
}

/// Credentials for privileged callers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token for the admin API; admin auth is disabled when unset
    pub admin_token: Option<String>,

    /// Shared key zone peers present on internal RPCs
    pub peer_key: Option<String>,
}

impl Config {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ZONELOG")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break election liveness or federation
    pub fn validate(&self) -> Result<()> {
        let raft = &self.raft;
        if raft.heartbeat_interval_ms == 0 || raft.rpc_timeout_ms == 0 || raft.tick_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat, rpc timeout and tick must be non-zero".into(),
            ));
        }
        if raft.election_timeout_min_ms > raft.election_timeout_max_ms {
            return Err(Error::InvalidConfig(format!(
                "election timeout bounds inverted: {} > {}",
                raft.election_timeout_min_ms, raft.election_timeout_max_ms
            )));
        }
        if raft.heartbeat_interval_ms >= raft.election_timeout_min_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the election timeout {}ms",
                raft.heartbeat_interval_ms, raft.election_timeout_min_ms
            )));
        }
        if raft.rpc_timeout_ms >= raft.election_timeout_min_ms {
            return Err(Error::InvalidConfig(format!(
                "rpc timeout {}ms must be below the election timeout {}ms",
                raft.rpc_timeout_ms, raft.election_timeout_min_ms
            )));
        }

        if self.endpoint.is_empty() {
            return Err(Error::InvalidConfig("endpoint must be set".into()));
        }
        if let Some(peer) = self.peers.iter().find(|p| p.endpoint.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "peer {} has no endpoint",
                peer.id
            )));
        }

        match self.federation.mode {
            FederationMode::Slave if self.federation.master_zone_id.is_none() => {
                return Err(Error::InvalidConfig(
                    "federation slave requires master_zone_id".into(),
                ))
            }
            FederationMode::Slave if self.federation.master_zone_id == Some(self.zone_id) => {
                return Err(Error::InvalidConfig(
                    "federation slave cannot be its own master".into(),
                ))
            }
            FederationMode::Master => {
                if let Some(slave) = self
                    .federation
                    .slaves
                    .iter()
                    .find(|s| s.endpoints.is_empty() || s.zone_id == self.zone_id)
                {
                    return Err(Error::InvalidConfig(format!(
                        "invalid federation slave zone {}",
                        slave.zone_id
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("zone.wal")
    }

    pub fn fed_wal_path(&self) -> PathBuf {
        self.data_dir.join("federation.wal")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("audit.log")
    }
}
