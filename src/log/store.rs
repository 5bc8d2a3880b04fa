//! Durable, append-only, indexable log store
//!
//! Records live in memory in a `BTreeMap` keyed by index and every mutation
//! is written to the WAL before it becomes visible. Reads take a shared lock;
//! writers are serialized on the WAL mutex. The store knows nothing about
//! terms beyond what the records carry.

use crate::common::{Error, Result, WalSyncPolicy};
use crate::log::wal::{Wal, WalOp, WalReader};
use crate::log::LogRecord;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Rewrite the WAL on open when it holds this many more frames than records
const COMPACT_SLACK: u64 = 256;

#[derive(Default)]
struct LogState {
    records: BTreeMap<u64, LogRecord>,
    applied_index: u64,
}

impl LogState {
    fn last_index(&self) -> u64 {
        self.records.keys().next_back().copied().unwrap_or(0)
    }

    fn replay(&mut self, op: WalOp) {
        match op {
            WalOp::Append(record) => {
                // a later append at an existing index implies a lost truncate frame
                if record.index <= self.last_index() {
                    self.records.split_off(&record.index);
                }
                if record.applied {
                    self.applied_index = self.applied_index.max(record.index);
                }
                self.records.insert(record.index, record);
            }
            WalOp::Truncate { from } => {
                self.records.split_off(&from);
                self.applied_index = self.applied_index.min(from.saturating_sub(1));
            }
            WalOp::Applied { index } => {
                if let Some(record) = self.records.get_mut(&index) {
                    record.applied = true;
                    self.applied_index = self.applied_index.max(index);
                }
            }
        }
    }
}

struct StoreInner {
    sync_policy: WalSyncPolicy,
    state: RwLock<LogState>,
    wal: Mutex<Wal>,
}

/// Cheaply cloneable handle to one log
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<StoreInner>,
}

impl LogStore {
    /// Open (or create) the log at `path`, replaying its WAL
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut state = LogState::default();
        let mut reader = WalReader::open(&path)?;
        for op in &mut reader {
            state.replay(op);
        }
        let end = reader.finish()?;

        let live = state.records.len() as u64;
        let wal = if end.frames > live * 2 + COMPACT_SLACK {
            info!(
                "compacting {}: {} frames for {} records",
                path.display(),
                end.frames,
                live
            );
            let ops: Vec<WalOp> = state.records.values().cloned().map(WalOp::Append).collect();
            Wal::rewrite(&path, sync_policy, &ops)?
        } else {
            Wal::open(&path, sync_policy, end.valid_len, end.frames)?
        };

        info!(
            "opened log {} (last index {}, applied {}{})",
            path.display(),
            state.last_index(),
            state.applied_index,
            if end.torn { ", torn tail dropped" } else { "" }
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                sync_policy,
                state: RwLock::new(state),
                wal: Mutex::new(wal),
            }),
        })
    }

    pub fn sync_policy(&self) -> WalSyncPolicy {
        self.inner.sync_policy
    }

    /// Append at `last_index() + 1`
    pub fn append(&self, record: LogRecord) -> Result<()> {
        let mut wal = self.inner.wal.lock();

        let last = self.last_index();
        if record.index != last + 1 {
            return Err(Error::LogInconsistency {
                index: record.index,
                reason: format!("append must follow last index {}", last),
            });
        }

        wal.append(&WalOp::Append(record.clone()))?;

        let mut state = self.inner.state.write();
        if record.applied {
            state.applied_index = record.index;
        }
        state.records.insert(record.index, record);
        Ok(())
    }

    /// Append an already-executed record unless its index is already present.
    /// Returns whether the record was written.
    pub fn append_applied_if_absent(&self, mut record: LogRecord) -> Result<bool> {
        if record.index <= self.last_index() {
            return Ok(false);
        }
        record.applied = true;
        self.append(record)?;
        Ok(true)
    }

    pub fn get(&self, index: u64) -> Option<LogRecord> {
        self.inner.state.read().records.get(&index).cloned()
    }

    /// Term of the record at `index`; position 0 is the empty prefix with term 0
    pub fn term_at(&self, index: u64) -> Option<u32> {
        if index == 0 {
            return Some(0);
        }
        self.inner.state.read().records.get(&index).map(|r| r.term)
    }

    pub fn last_index(&self) -> u64 {
        self.inner.state.read().last_index()
    }

    /// `(last_index, last_term)` read under one lock
    pub fn last_position(&self) -> (u64, u32) {
        let state = self.inner.state.read();
        match state.records.values().next_back() {
            Some(r) => (r.index, r.term),
            None => (0, 0),
        }
    }

    /// Highest index executed against local storage
    pub fn applied_index(&self) -> u64 {
        self.inner.state.read().applied_index
    }

    /// Highest federation index carried by any record
    pub fn last_fed_index(&self) -> u64 {
        self.inner
            .state
            .read()
            .records
            .values()
            .map(|r| r.fed_index)
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `from` and every later record. Returns how many were removed.
    pub fn truncate_from(&self, from: u64) -> Result<u64> {
        let mut wal = self.inner.wal.lock();

        let count = self.inner.state.read().records.range(from..).count() as u64;
        if count == 0 {
            return Ok(0);
        }

        wal.append(&WalOp::Truncate { from })?;

        let mut state = self.inner.state.write();
        state.records.split_off(&from);
        state.applied_index = state.applied_index.min(from.saturating_sub(1));
        debug!("truncated {} records from index {}", count, from);
        Ok(count)
    }

    /// Flag the record at `index` as executed
    pub fn mark_applied(&self, index: u64) -> Result<()> {
        let mut wal = self.inner.wal.lock();

        match self.inner.state.read().records.get(&index) {
            None => {
                return Err(Error::LogInconsistency {
                    index,
                    reason: "cannot mark a missing record applied".into(),
                })
            }
            Some(r) if r.applied => return Ok(()),
            Some(_) => {}
        }

        wal.append(&WalOp::Applied { index })?;

        let mut state = self.inner.state.write();
        if let Some(record) = state.records.get_mut(&index) {
            record.applied = true;
        }
        state.applied_index = state.applied_index.max(index);
        Ok(())
    }

    /// Lazily walk records starting at `from` until the first gap or the end
    pub fn iter_from(&self, from: u64) -> RecordIter {
        RecordIter {
            inner: Arc::clone(&self.inner),
            next: from.max(1),
        }
    }

    /// Flush and fsync the WAL
    pub fn sync(&self) -> Result<()> {
        self.inner.wal.lock().sync()
    }
}

/// Finite, single-pass cursor over a [`LogStore`]
///
/// Each step takes the read lock briefly, so a concurrent truncate ends the
/// walk instead of blocking on it.
pub struct RecordIter {
    inner: Arc<StoreInner>,
    next: u64,
}

impl Iterator for RecordIter {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        let record = self.inner.state.read().records.get(&self.next).cloned()?;
        self.next += 1;
        Some(record)
    }
}
