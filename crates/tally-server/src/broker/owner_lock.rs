//! Per-owner async mutual exclusion.
//!
//! Subscribe, unsubscribe and disconnect cleanup each check the index and
//! then open or close a watch. Holding the owner's lock across both steps
//! makes the pair atomic with respect to other requests for the same owner,
//! while requests for different owners never contend.
//!
//! Locks are created on demand and retired when their owner becomes empty,
//! so the table does not grow with every owner ever seen.

use std::sync::Arc;

use dashmap::DashMap;
use tally_core::OwnerKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// The `bool` is the retired flag.
type Slot = Arc<Mutex<bool>>;

/// Keyed table of owner locks.
#[derive(Default)]
pub struct OwnerLocks {
    slots: DashMap<OwnerKey, Slot>,
}

/// Exclusive access to one owner until dropped or retired.
pub struct OwnerGuard<'a> {
    locks: &'a OwnerLocks,
    owner: OwnerKey,
    slot: Slot,
    guard: OwnedMutexGuard<bool>,
}

impl OwnerLocks {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `owner`.
    pub async fn acquire(&self, owner: &OwnerKey) -> OwnerGuard<'_> {
        loop {
            let slot = Arc::clone(self.slots.entry(owner.clone()).or_default().value());
            let guard = Arc::clone(&slot).lock_owned().await;
            if *guard {
                // Retired while we waited; a fresh slot replaces it.
                continue;
            }
            return OwnerGuard {
                locks: self,
                owner: owner.clone(),
                slot,
                guard,
            };
        }
    }

    /// Number of owners with a live lock.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl OwnerGuard<'_> {
    /// Release the lock and drop it from the table. Waiters queued on it
    /// retry against a new lock.
    pub fn retire(mut self) {
        *self.guard = true;
        let _ = self
            .locks
            .slots
            .remove_if(&self.owner, |_, slot| Arc::ptr_eq(slot, &self.slot));
    }
}
