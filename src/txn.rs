//! Deferred-write transaction buffer
//!
//! Writes and deletes accumulate locally and reach the backend only on
//! commit; reads within the same unit of work observe staged values without
//! a round trip. Commit groups pending writes by TTL so entries sharing an
//! expiry go out as one multi-key write.

use std::collections::{HashMap, HashSet};

use crate::backend::Expiry;

/// What the buffer knows about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Staged or previously fetched bytes.
    Value(Vec<u8>),
    /// A delete is staged; the key must read as absent.
    Deleted,
    /// The buffer has no opinion; ask the backend.
    Unknown,
}

/// A staged operation pulled out of the buffer ahead of commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedOp {
    Write(Vec<u8>, Expiry),
    Delete,
}

/// Everything to flush on commit, writes grouped by expiry.
#[derive(Debug, Default)]
pub struct CommitBatch {
    pub writes: HashMap<Expiry, Vec<(String, Vec<u8>)>>,
    pub deletes: Vec<String>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }
}

/// Local staging area for one logical unit of work.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    pending_writes: HashMap<String, (Vec<u8>, Expiry)>,
    pending_deletes: HashSet<String>,
    read_cache: HashMap<String, Vec<u8>>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a write. The read cache is updated immediately so a subsequent
    /// get observes the new value (read-your-writes).
    pub fn stage_set(&mut self, key: &str, value: Vec<u8>, expiry: Expiry) {
        self.pending_deletes.remove(key);
        self.read_cache.insert(key.to_owned(), value.clone());
        self.pending_writes.insert(key.to_owned(), (value, expiry));
    }

    /// Stage a delete, discarding any pending write for the key.
    pub fn stage_delete(&mut self, key: &str) {
        self.pending_writes.remove(key);
        self.read_cache.remove(key);
        self.pending_deletes.insert(key.to_owned());
    }

    /// Resolution order: read cache, staged delete, staged write, backend.
    pub fn resolve(&self, key: &str) -> Resolution {
        if let Some(bytes) = self.read_cache.get(key) {
            return Resolution::Value(bytes.clone());
        }
        if self.pending_deletes.contains(key) {
            return Resolution::Deleted;
        }
        if let Some((bytes, _)) = self.pending_writes.get(key) {
            return Resolution::Value(bytes.clone());
        }
        Resolution::Unknown
    }

    /// Remember bytes fetched from the backend so repeated reads stay local.
    pub fn note_read(&mut self, key: &str, value: Vec<u8>) {
        if self.pending_deletes.contains(key) {
            return;
        }
        self.read_cache.insert(key.to_owned(), value);
    }

    /// Whether the buffer already holds any state for `key`.
    pub fn knows(&self, key: &str) -> bool {
        self.read_cache.contains_key(key) || self.pending_writes.contains_key(key)
    }

    /// Drop the cached read for `key` after an out-of-band mutation
    /// (increment/decrement) made it stale.
    pub fn forget(&mut self, key: &str) {
        self.read_cache.remove(key);
    }

    /// Pull the staged operation for one key out of the buffer, leaving any
    /// cached read in place. Used when a CAS read needs the key's state to
    /// reach the backend first.
    pub fn take_staged(&mut self, key: &str) -> Option<StagedOp> {
        if self.pending_deletes.remove(key) {
            return Some(StagedOp::Delete);
        }
        self.pending_writes
            .remove(key)
            .map(|(bytes, expiry)| StagedOp::Write(bytes, expiry))
    }

    /// Record a write that already reached the backend (a successful
    /// conditioned write): it supersedes anything staged for the key.
    pub fn apply_write_through(&mut self, key: &str, value: Vec<u8>) {
        self.pending_writes.remove(key);
        self.pending_deletes.remove(key);
        self.read_cache.insert(key.to_owned(), value);
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending_writes.is_empty() || !self.pending_deletes.is_empty()
    }

    /// Drain everything pending into a commit batch and clear the buffer.
    pub fn take_pending(&mut self) -> CommitBatch {
        let mut batch = CommitBatch::default();
        for (key, (bytes, expiry)) in self.pending_writes.drain() {
            batch.writes.entry(expiry).or_default().push((key, bytes));
        }
        batch.deletes = self.pending_deletes.drain().collect();
        self.read_cache.clear();
        batch
    }

    /// Discard pending mutations without contacting the backend.
    pub fn rollback(&mut self) {
        self.cleanup();
    }

    /// Unconditional clear of all three structures.
    pub fn cleanup(&mut self) {
        self.pending_writes.clear();
        self.pending_deletes.clear();
        self.read_cache.clear();
    }
}
