//! Per-server application context
//!
//! Built once at startup and handed to the RPC surfaces; owns the consensus,
//! federation and directory components of one zone server.

use crate::common::raft::RaftStatus;
use crate::common::{
    AuditLogger, Authenticator, Config, Error, FederationMode, RaftMetrics, Result,
};
use crate::consensus::{
    start_raft_tasks, FedTag, RaftManager, RaftParts, SledStateStore, StateApplier,
};
use crate::federation::{start_fed_tasks, FedReplicaManager, FedSink};
use crate::log::LogStore;
use crate::rpc::transport::Transport;
use crate::zone::directory::ZoneDirectory;
use crate::zone::metadata::MetadataStore;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct ServerContext {
    pub config: Config,
    pub directory: Arc<ZoneDirectory>,
    pub metrics: Arc<RaftMetrics>,
    pub audit: Arc<AuditLogger>,
    pub auth: Authenticator,
    /// Absent in cache mode
    raft: Option<Arc<RaftManager>>,
    fed: Option<Arc<FedReplicaManager>>,
    membership: tokio::sync::Mutex<()>,
}

impl ServerContext {
    /// Open storage under `config.data_dir`, applying committed commands to
    /// the bundled sled state store
    pub fn open(config: Config, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let applier = Arc::new(SledStateStore::open(config.state_path())?);
        Self::open_with_applier(config, transport, applier)
    }

    pub fn open_with_applier(
        config: Config,
        transport: Arc<dyn Transport>,
        applier: Arc<dyn StateApplier>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let metadata = Arc::new(MetadataStore::open(config.metadata_path())?);
        let directory = Arc::new(ZoneDirectory::open(
            metadata.clone(),
            ZoneDirectory::seed_from_config(&config),
        )?);
        let metrics = Arc::new(RaftMetrics::new());
        let audit = Arc::new(AuditLogger::new(config.audit_path(), true));
        let auth = Authenticator::new(config.auth.clone());

        if config.cache {
            tracing::info!(
                "Server {} (zone {}) running in cache mode",
                config.server_id,
                config.zone_id
            );
            return Ok(Arc::new(Self {
                config,
                directory,
                metrics,
                audit,
                auth,
                raft: None,
                fed: None,
                membership: tokio::sync::Mutex::new(()),
            }));
        }

        let log = LogStore::open(config.wal_path(), config.wal_sync)?;
        let fed_log = match config.federation.mode {
            FederationMode::Standalone => None,
            _ => Some(LogStore::open(config.fed_wal_path(), config.wal_sync)?),
        };

        let raft = Arc::new(RaftManager::new(RaftParts {
            server_id: config.server_id,
            zone_id: config.zone_id,
            config: config.raft.clone(),
            log,
            fed_log: fed_log.clone(),
            applier,
            metadata,
            directory: directory.clone(),
            transport: transport.clone(),
            metrics: metrics.clone(),
            audit: audit.clone(),
        })?);

        let fed = fed_log.map(|fed_log| {
            Arc::new(FedReplicaManager::new(
                config.zone_id,
                config.cache,
                &config.federation,
                fed_log,
                raft.clone() as Arc<dyn FedSink>,
                transport,
                config.raft.replicate_timeout(),
                metrics.clone(),
            ))
        });

        Ok(Arc::new(Self {
            config,
            directory,
            metrics,
            audit,
            auth,
            raft: Some(raft),
            fed,
            membership: tokio::sync::Mutex::new(()),
        }))
    }

    /// Spawn the background loops. Nothing runs in cache mode.
    pub fn start(&self) -> Vec<JoinHandle<Result<()>>> {
        let mut tasks = Vec::new();
        if let Some(raft) = &self.raft {
            tasks.push(start_raft_tasks(raft.clone()));
        }
        if let Some(fed) = &self.fed {
            if fed.mode() == FederationMode::Master {
                tasks.push(start_fed_tasks(fed.clone()));
            }
        }
        tasks
    }

    pub fn shutdown(&self) {
        if let Some(raft) = &self.raft {
            raft.shutdown();
        }
        if let Some(fed) = &self.fed {
            fed.shutdown();
        }
    }

    pub fn raft(&self) -> Result<&Arc<RaftManager>> {
        self.raft.as_ref().ok_or(Error::CacheMode)
    }

    pub fn fed(&self) -> Result<&Arc<FedReplicaManager>> {
        if self.config.cache {
            return Err(Error::CacheMode);
        }
        self.fed.as_ref().ok_or_else(|| {
            Error::Federation(format!("zone {} is not federated", self.config.zone_id))
        })
    }

    pub(crate) fn membership_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.membership
    }

    /// Stop participating after a fatal storage error
    pub fn halt(&self, cause: &Error) {
        if let Some(raft) = &self.raft {
            raft.halt(cause);
        }
        self.shutdown();
    }

    pub fn status(&self) -> Result<RaftStatus> {
        Ok(self.raft()?.status())
    }

    /// Replicate a zone-local command through the leader
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.raft()?.replicate(sql, FedTag::None).await
    }

    /// Replicate a command that is also shipped to every slave zone
    pub async fn execute_federated(&self, sql: &str) -> Result<u64> {
        if self.config.federation.mode != FederationMode::Master {
            return Err(Error::Federation(format!(
                "zone {} is not a federation master",
                self.config.zone_id
            )));
        }
        self.raft()?.replicate(sql, FedTag::Next).await
    }
}
