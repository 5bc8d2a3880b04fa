//! Durable replicated-log storage

pub mod record;
pub mod store;
pub mod wal;

pub use record::LogRecord;
pub use store::{LogStore, RecordIter};
pub use wal::{Wal, WalOp, WalReader};
