//! Per-id Lock Registry
//!
//! Hands out one async mutex per pool id so that reconfigurations of the
//! same pool serialize while different pools proceed in parallel. Two
//! callers asking for the same id always receive the same lock object;
//! equal-valued but separately-allocated id strings never yield distinct
//! locks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Registry of per-pool-id async locks.
///
/// Entries live for the lifetime of the process. A lock is a bare mutex
/// around no data; it exists purely to serialize critical sections keyed
/// by id.
pub struct IdLockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Get the lock for `id`, creating it on first use. Concurrent callers
    /// racing on a fresh id converge on a single lock.
    pub fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(id) {
            return existing.clone();
        }
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for IdLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}
