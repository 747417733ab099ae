//! Subscription index: owner key → set of subscribed connections.
//!
//! A reverse map (connection → owners) makes disconnect cleanup
//! proportional to what the connection subscribed to. Neither map keeps an
//! entry for an empty set. Mutations for one owner serialize on that
//! owner's shard entry.

use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tally_core::{ConnectionId, OwnerKey};

/// Bidirectional subscription index.
#[derive(Default)]
pub struct SubscriptionIndex {
    by_owner: DashMap<OwnerKey, HashSet<ConnectionId>>,
    by_connection: DashMap<ConnectionId, HashSet<OwnerKey>>,
}

impl SubscriptionIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `id` to `owner`. Returns `true` if `id` is now the owner's
    /// only subscriber (the 0→1 transition). Re-subscribing is a no-op.
    pub fn add(&self, owner: &OwnerKey, id: &ConnectionId) -> bool {
        let (inserted, is_first) = {
            let mut subscribers = self.by_owner.entry(owner.clone()).or_default();
            let inserted = subscribers.insert(id.clone());
            (inserted, inserted && subscribers.len() == 1)
        };
        if inserted {
            let _ = self
                .by_connection
                .entry(id.clone())
                .or_default()
                .insert(owner.clone());
        }
        is_first
    }

    /// Unsubscribe `id` from `owner`. Returns `true` if the owner is left
    /// with no subscribers (the 1→0 transition). Removing a pair that is not
    /// subscribed is a no-op returning `false`.
    pub fn remove(&self, owner: &OwnerKey, id: &ConnectionId) -> bool {
        let (removed, is_last) = match self.by_owner.entry(owner.clone()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(id);
                if entry.get().is_empty() {
                    let _ = entry.remove();
                    (removed, removed)
                } else {
                    (removed, false)
                }
            }
            Entry::Vacant(_) => return false,
        };
        if removed {
            self.forget_reverse(id, owner);
        }
        is_last
    }

    /// Remove `id` from every owner it subscribed to. Returns the owners
    /// that became empty as a result, each once.
    pub fn remove_connection_everywhere(&self, id: &ConnectionId) -> Vec<OwnerKey> {
        let Some((_, owners)) = self.by_connection.remove(id) else {
            return Vec::new();
        };
        let mut emptied = Vec::new();
        for owner in owners {
            if let Entry::Occupied(mut entry) = self.by_owner.entry(owner) {
                if entry.get_mut().remove(id) && entry.get().is_empty() {
                    let (owner, _) = entry.remove_entry();
                    emptied.push(owner);
                }
            }
        }
        emptied
    }

    /// Snapshot of the owner's current subscribers.
    pub fn subscribers(&self, owner: &OwnerKey) -> Vec<ConnectionId> {
        self.by_owner
            .get(owner)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Owners `id` is subscribed to.
    pub fn owners_of(&self, id: &ConnectionId) -> Vec<OwnerKey> {
        self.by_connection
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `id` is subscribed to `owner`.
    pub fn contains(&self, owner: &OwnerKey, id: &ConnectionId) -> bool {
        self.by_owner
            .get(owner)
            .is_some_and(|set| set.contains(id))
    }

    /// Number of owners with at least one subscriber.
    pub fn owner_count(&self) -> usize {
        self.by_owner.len()
    }

    /// Number of subscribers for `owner`.
    pub fn subscriber_count(&self, owner: &OwnerKey) -> usize {
        self.by_owner.get(owner).map_or(0, |set| set.len())
    }

    fn forget_reverse(&self, id: &ConnectionId, owner: &OwnerKey) {
        if let Entry::Occupied(mut entry) = self.by_connection.entry(id.clone()) {
            let _ = entry.get_mut().remove(owner);
            if entry.get().is_empty() {
                let _ = entry.remove();
            }
        }
    }
}
