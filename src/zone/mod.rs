//! Zone server: directory, membership and the daemon around the consensus core

pub mod context;
pub mod directory;
pub mod membership;
pub mod metadata;
pub mod server;

pub use context::ServerContext;
pub use directory::{ZoneDirectory, ZoneServer};
pub use membership::{add_server, delete_server, reset_server, MembershipChange};
pub use metadata::MetadataStore;
pub use server::ZoneServerNode;
