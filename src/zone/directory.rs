//! Zone server directory
//!
//! Maps `(zone_id, server_id)` to the server's endpoint. Seeded from the
//! bootstrap configuration on first start, afterwards changed only by
//! committed membership commands.

use crate::common::{Config, Result, ServerId, ZoneId};
use crate::zone::membership::MembershipChange;
use crate::zone::metadata::MetadataStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneServer {
    pub zone_id: ZoneId,
    pub id: ServerId,
    pub name: String,
    pub endpoint: String,
}

pub struct ZoneDirectory {
    servers: RwLock<BTreeMap<(ZoneId, ServerId), ZoneServer>>,
    metadata: Arc<MetadataStore>,
}

impl ZoneDirectory {
    /// Load the persisted pool. `seed` is written only when the pool is empty.
    pub fn open(metadata: Arc<MetadataStore>, seed: Vec<ZoneServer>) -> Result<Self> {
        let mut servers: BTreeMap<_, _> = metadata
            .list_servers()?
            .into_iter()
            .map(|s| ((s.zone_id, s.id), s))
            .collect();

        if servers.is_empty() {
            for server in seed {
                metadata.put_server(&server)?;
                servers.insert((server.zone_id, server.id), server);
            }
        }

        Ok(Self {
            servers: RwLock::new(servers),
            metadata,
        })
    }

    /// Bootstrap members of the local zone: configured peers plus ourselves
    pub fn seed_from_config(config: &Config) -> Vec<ZoneServer> {
        let mut seed: Vec<ZoneServer> = config
            .peers
            .iter()
            .map(|p| ZoneServer {
                zone_id: config.zone_id,
                id: p.id,
                name: p.name.clone(),
                endpoint: p.endpoint.clone(),
            })
            .collect();

        if !seed.iter().any(|s| s.id == config.server_id) {
            seed.push(ZoneServer {
                zone_id: config.zone_id,
                id: config.server_id,
                name: format!("zs{}", config.server_id),
                endpoint: config.endpoint.clone(),
            });
        }
        seed
    }

    pub fn members(&self, zone_id: ZoneId) -> Vec<ZoneServer> {
        self.servers
            .read()
            .range((zone_id, ServerId::MIN)..=(zone_id, ServerId::MAX))
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Members of `zone_id` other than `exclude`
    pub fn peers(&self, zone_id: ZoneId, exclude: ServerId) -> Vec<ZoneServer> {
        self.members(zone_id)
            .into_iter()
            .filter(|s| s.id != exclude)
            .collect()
    }

    pub fn get(&self, zone_id: ZoneId, server_id: ServerId) -> Option<ZoneServer> {
        self.servers.read().get(&(zone_id, server_id)).cloned()
    }

    pub fn endpoint(&self, zone_id: ZoneId, server_id: ServerId) -> Option<String> {
        self.get(zone_id, server_id).map(|s| s.endpoint)
    }

    pub fn len(&self, zone_id: ZoneId) -> usize {
        self.members(zone_id).len()
    }

    pub fn contains_endpoint(&self, zone_id: ZoneId, endpoint: &str) -> bool {
        self.members(zone_id).iter().any(|s| s.endpoint == endpoint)
    }

    /// Lowest unused id above every current member of the zone
    pub fn next_server_id(&self, zone_id: ZoneId) -> ServerId {
        self.members(zone_id)
            .iter()
            .map(|s| s.id + 1)
            .max()
            .unwrap_or(0)
    }

    /// Apply a committed membership command
    pub fn apply(&self, change: &MembershipChange) -> Result<()> {
        match change {
            MembershipChange::Add(server) => {
                self.metadata.put_server(server)?;
                self.servers
                    .write()
                    .insert((server.zone_id, server.id), server.clone());
                tracing::info!(
                    "zone {}: server {} ({}) joined at {}",
                    server.zone_id,
                    server.id,
                    server.name,
                    server.endpoint
                );
            }
            MembershipChange::Delete { zone_id, server_id } => {
                self.metadata.delete_server(*zone_id, *server_id)?;
                self.servers.write().remove(&(*zone_id, *server_id));
                tracing::info!("zone {}: server {} removed", zone_id, server_id);
            }
        }
        Ok(())
    }
}
