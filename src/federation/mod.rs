//! One-way log shipping from a federation master zone to its slave zones

pub mod replicator;

pub use replicator::{
    start_fed_tasks, FedApplyOutcome, FedReplicaManager, FederationCursor, SlaveProgress,
};

use crate::common::{Result, ServerId};

/// Where a slave zone hands received federation records: its own zone log
#[tonic::async_trait]
pub trait FedSink: Send + Sync {
    fn is_leader(&self) -> bool;

    fn leader_hint(&self) -> Option<ServerId>;

    /// Replicate `sql` through the zone under federation index `fed_index`
    /// and wait until it is applied here. Returns the zone log index.
    async fn submit_federated(&self, fed_index: u64, sql: &str) -> Result<u64>;
}
