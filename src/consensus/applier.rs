//! Execution of committed commands against local storage
//!
//! The relational engine that really runs replicated statements lives outside
//! this crate; the consensus core only sees [`StateApplier`]. `SledStateStore`
//! is the bundled implementation: it records every applied statement by index,
//! which is enough for the daemon to be useful standalone and for tests to
//! check exactly-once application.

use crate::common::Result;
use std::path::Path;

/// Runs a committed command. Must be idempotent per `index`: applying the
/// same index twice has the effect of applying it once.
pub trait StateApplier: Send + Sync {
    fn apply(&self, index: u64, sql: &str) -> Result<()>;
}

const APPLIED_TREE: &str = "applied";

pub struct SledStateStore {
    db: sled::Db,
    applied: sled::Tree,
}

impl SledStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let applied = db.open_tree(APPLIED_TREE)?;
        Ok(Self { db, applied })
    }

    /// Statement applied at `index`, if any
    pub fn get(&self, index: u64) -> Result<Option<String>> {
        Ok(self
            .applied
            .get(index.to_be_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Lazily iterate applied rows in index order
    pub fn rows(&self) -> AppliedRows {
        AppliedRows {
            iter: self.applied.iter(),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl StateApplier for SledStateStore {
    fn apply(&self, index: u64, sql: &str) -> Result<()> {
        let swapped = self.applied.compare_and_swap(
            index.to_be_bytes(),
            None as Option<&[u8]>,
            Some(sql.as_bytes()),
        )?;
        if swapped.is_err() {
            tracing::debug!("index {} already applied, skipping", index);
        }
        Ok(())
    }
}

/// Finite, single-pass cursor over applied rows
pub struct AppliedRows {
    iter: sled::Iter,
}

impl Iterator for AppliedRows {
    type Item = Result<(u64, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.iter.next()?;
        Some(item.map_err(Into::into).map(|(k, v)| {
            let mut key = [0u8; 8];
            key.copy_from_slice(&k[..8]);
            (
                u64::from_be_bytes(key),
                String::from_utf8_lossy(&v).into_owned(),
            )
        }))
    }
}
