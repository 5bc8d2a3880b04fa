//! Metadata store using sled
//!
//! Stores:
//! - Hard consensus state (current term, vote)
//! - Zone server pool (zone_id, server_id → name, endpoint)

use crate::common::{Result, ServerId, ZoneId};
use crate::consensus::HardState;
use crate::zone::directory::ZoneServer;
use std::path::Path;

const TREE_STATE: &str = "state";
const TREE_SERVERS: &str = "zone_servers";

const KEY_HARD_STATE: &[u8] = b"hard_state";

pub struct MetadataStore {
    db: sled::Db,
    state: sled::Tree,
    servers: sled::Tree,
}

impl MetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway store for simulations and tests
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let state = db.open_tree(TREE_STATE)?;
        let servers = db.open_tree(TREE_SERVERS)?;
        Ok(Self { db, state, servers })
    }

    // === Hard state ===

    pub fn load_hard_state(&self) -> Result<HardState> {
        match self.state.get(KEY_HARD_STATE)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(HardState::default()),
        }
    }

    /// Durable before returning: votes and terms must not be forgotten
    pub fn save_hard_state(&self, hard: &HardState) -> Result<()> {
        let value = bincode::serialize(hard)?;
        self.state.insert(KEY_HARD_STATE, value)?;
        self.db.flush()?;
        Ok(())
    }

    // === Zone servers ===

    fn server_key(zone_id: ZoneId, server_id: ServerId) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&zone_id.to_be_bytes());
        key[4..].copy_from_slice(&server_id.to_be_bytes());
        key
    }

    pub fn put_server(&self, server: &ZoneServer) -> Result<()> {
        let value = bincode::serialize(server)?;
        self.servers
            .insert(Self::server_key(server.zone_id, server.id), value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete_server(&self, zone_id: ZoneId, server_id: ServerId) -> Result<()> {
        self.servers.remove(Self::server_key(zone_id, server_id))?;
        self.db.flush()?;
        Ok(())
    }

    pub fn list_servers(&self) -> Result<Vec<ZoneServer>> {
        let mut servers = Vec::new();
        for item in self.servers.iter() {
            let (_, value) = item?;
            servers.push(bincode::deserialize(&value)?);
        }
        Ok(servers)
    }
}
