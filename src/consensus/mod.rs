//! Raft-derived election and replication for zone servers

pub mod applier;
pub mod coordinator;
pub mod state;

pub use applier::{SledStateStore, StateApplier};
pub use coordinator::{
    start_raft_tasks, FedTag, FollowerProgress, RaftManager, RaftParts, LEADER_NOOP,
};
pub use state::{Admission, ConsensusState, HardState};
