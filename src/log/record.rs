//! Log record

use serde::{Deserialize, Serialize};

/// One entry of a zone (or federation) log.
///
/// Two records at the same index on different servers must carry the same
/// `term` and `sql`; [`LogRecord::same_entry`] is the comparison used for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Dense, 1-based position in the log
    pub index: u64,
    /// Leader term the record was appended under
    pub term: u32,
    /// Serialized state-change statement
    pub sql: String,
    /// Unix seconds at append time on the originating leader
    pub timestamp: i64,
    /// Position in the federation sequence, 0 when not federated
    pub fed_index: u64,
    /// Already executed against local storage
    pub applied: bool,
}

impl LogRecord {
    pub fn new(index: u64, term: u32, sql: impl Into<String>, fed_index: u64) -> Self {
        Self {
            index,
            term,
            sql: sql.into(),
            timestamp: crate::common::timestamp_now(),
            fed_index,
            applied: false,
        }
    }

    /// Same position, term and command (timestamps and applied flags are local)
    pub fn same_entry(&self, other: &LogRecord) -> bool {
        self.index == other.index && self.term == other.term && self.sql == other.sql
    }
}
