//! Non-blocking advisory locks over part ranges.
//!
//! A lock is identified by `(upload_id, lower, upper)`. Acquisition never
//! waits: either every requested range is free and all are taken, or none is.
//! Locks are process-local; each process composing for an upload must share
//! one table.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use splice_core::PartRange;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

type LockKey = (Uuid, u32, u32);

/// Table of currently held range locks.
#[derive(Clone, Debug, Default)]
pub struct RangeLockTable {
    held: Arc<DashMap<LockKey, ()>>,
}

/// Releases its locks when dropped.
#[derive(Debug)]
pub struct RangeLockGuard {
    held: Arc<DashMap<LockKey, ()>>,
    keys: Vec<LockKey>,
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        for key in &self.keys {
            self.held.remove(key);
        }
    }
}

impl RangeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every lock in `ranges`, or none of them.
    ///
    /// Naming the same range twice takes it once.
    pub fn try_acquire(&self, upload_id: Uuid, ranges: &[PartRange]) -> Option<RangeLockGuard> {
        let mut wanted: Vec<LockKey> = ranges
            .iter()
            .map(|r| (upload_id, r.lower(), r.upper()))
            .collect();
        wanted.sort_unstable();
        wanted.dedup();

        let mut guard = RangeLockGuard {
            held: self.held.clone(),
            keys: Vec::with_capacity(wanted.len()),
        };
        for key in wanted {
            // The entry's shard lock must be released before the guard can drop.
            let taken = match self.held.entry(key) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(());
                    true
                }
            };
            if !taken {
                tracing::trace!(upload_id = %upload_id, lower = key.1, upper = key.2, "range lock busy");
                return None;
            }
            guard.keys.push(key);
        }
        Some(guard)
    }

    /// Run `action` while holding every lock in `ranges`.
    ///
    /// Returns `None` without running `action` when any lock is already held.
    /// Locks are released once `action` finishes, including on error or panic.
    pub async fn attempt_lock_and_run<F, Fut, T>(
        &self,
        upload_id: Uuid,
        ranges: &[PartRange],
        action: F,
    ) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.try_acquire(upload_id, ranges)?;
        Some(action().await)
    }

    pub fn is_locked(&self, upload_id: Uuid, range: &PartRange) -> bool {
        self.held
            .contains_key(&(upload_id, range.lower(), range.upper()))
    }

    /// Number of locks currently held.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}
