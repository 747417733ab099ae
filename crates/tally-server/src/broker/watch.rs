//! Watch lifecycle: at most one change feed per owner.
//!
//! Per owner the state is either Unwatched or Watching. `ensure_watching`
//! opens a feed and spawns a pump that turns feed changes into
//! `data_update` fan-outs; `ensure_stopped` closes it. A feed that breaks,
//! ends, or goes quiet for longer than the feed timeout returns its owner to
//! Unwatched and notifies the owner's subscribers. Nothing reopens it
//! automatically.
//!
//! Every opened watch carries a generation number. A pump only tears down
//! the watch it was spawned for, so a late failure from an old feed cannot
//! remove a newer one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tally_core::{OutboundMessage, OwnerKey};
use tally_store::{ChangeFeed, FeedEvent, SharedStore, StoreError, WatchHandle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::dispatch::Dispatcher;
use crate::metrics::{
    WATCH_FEED_FAILURES_TOTAL, WATCH_OPEN_FAILURES_TOTAL, WATCHES_ACTIVE, WATCHES_CLOSED_TOTAL,
    WATCHES_OPENED_TOTAL,
};

/// Message pushed to subscribers when their owner's feed dies.
pub const FEED_INTERRUPTED: &str = "change feed interrupted";

struct ActiveWatch {
    generation: u64,
    handle: WatchHandle,
}

/// Owns every active watch.
pub struct WatchManager {
    store: SharedStore,
    dispatcher: Arc<Dispatcher>,
    watches: DashMap<OwnerKey, ActiveWatch>,
    next_generation: AtomicU64,
    feed_timeout: Option<Duration>,
}

enum Next {
    Event(FeedEvent),
    Closed,
    TimedOut,
}

impl WatchManager {
    /// Create a manager. `feed_timeout` of `None` disables silence detection.
    pub fn new(
        store: SharedStore,
        dispatcher: Arc<Dispatcher>,
        feed_timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            watches: DashMap::new(),
            next_generation: AtomicU64::new(1),
            feed_timeout,
        }
    }

    /// Open a watch for `owner` unless one is active.
    ///
    /// Returns `Ok(true)` if a watch was opened, `Ok(false)` if one already
    /// existed. Store failures leave the owner Unwatched. Callers hold the
    /// owner's lock.
    pub async fn ensure_watching(self: &Arc<Self>, owner: &OwnerKey) -> Result<bool, StoreError> {
        if self.watches.contains_key(owner) {
            return Ok(false);
        }

        let ChangeFeed { events, handle } = match self.store.open_change_feed(owner).await {
            Ok(feed) => feed,
            Err(e) => {
                let label = if e.is_not_found() {
                    "not_found"
                } else if e.is_unavailable() {
                    "unavailable"
                } else {
                    "other"
                };
                counter!(WATCH_OPEN_FAILURES_TOTAL, "error" => label).increment(1);
                warn!(owner = %owner, error = %e, "failed to open change feed");
                return Err(e);
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = handle.token();
        // Registered before the pump starts so a feed that fails at once
        // still finds its own entry to remove.
        if let Some(stale) = self
            .watches
            .insert(owner.clone(), ActiveWatch { generation, handle })
        {
            let _ = stale.handle.close();
            gauge!(WATCHES_ACTIVE).decrement(1.0);
        }
        counter!(WATCHES_OPENED_TOTAL).increment(1);
        gauge!(WATCHES_ACTIVE).increment(1.0);
        info!(owner = %owner, generation, "watch opened");

        let _pump = tokio::spawn(Arc::clone(self).pump(owner.clone(), generation, events, cancel));
        Ok(true)
    }

    /// Close the watch for `owner`. Returns `false` if none was active.
    pub fn ensure_stopped(&self, owner: &OwnerKey) -> bool {
        let Some((_, watch)) = self.watches.remove(owner) else {
            return false;
        };
        let _ = watch.handle.close();
        counter!(WATCHES_CLOSED_TOTAL).increment(1);
        gauge!(WATCHES_ACTIVE).decrement(1.0);
        info!(owner = %owner, generation = watch.generation, "watch closed");
        true
    }

    /// Whether `owner` is Watching.
    pub fn is_watching(&self, owner: &OwnerKey) -> bool {
        self.watches.contains_key(owner)
    }

    /// Number of active watches.
    pub fn active_count(&self) -> usize {
        self.watches.len()
    }

    /// Owners currently watched.
    pub fn watched_owners(&self) -> Vec<OwnerKey> {
        self.watches.iter().map(|e| e.key().clone()).collect()
    }

    /// Close every watch. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let closed = self
            .watched_owners()
            .iter()
            .filter(|owner| self.ensure_stopped(owner))
            .count();
        if closed > 0 {
            info!(closed, "all watches closed");
        }
        closed
    }

    async fn next_event(&self, events: &mut mpsc::Receiver<FeedEvent>) -> Next {
        let received = match self.feed_timeout {
            Some(limit) => match tokio::time::timeout(limit, events.recv()).await {
                Ok(received) => received,
                Err(_) => return Next::TimedOut,
            },
            None => events.recv().await,
        };
        received.map_or(Next::Closed, Next::Event)
    }

    #[instrument(skip_all, fields(owner = %owner, generation = generation))]
    async fn pump(
        self: Arc<Self>,
        owner: OwnerKey,
        generation: u64,
        mut events: mpsc::Receiver<FeedEvent>,
        cancel: CancellationToken,
    ) {
        let reason = loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    trace!("pump cancelled");
                    return;
                }
                next = self.next_event(&mut events) => next,
            };
            match next {
                Next::Event(FeedEvent::Change(payload)) => {
                    let report = self
                        .dispatcher
                        .send(&owner, &OutboundMessage::data_update(&owner, payload));
                    debug!(
                        recipients = report.recipients,
                        delivered = report.delivered,
                        dropped = report.dropped,
                        "change fanned out"
                    );
                }
                Next::Event(FeedEvent::Heartbeat) => trace!("feed heartbeat"),
                Next::Event(FeedEvent::Broken(reason)) => break reason,
                Next::Closed => break "change feed closed".to_string(),
                Next::TimedOut => break "change feed timed out".to_string(),
            }
        };
        self.fail_watch(&owner, generation, &reason);
    }

    /// Tear down `owner`'s watch if it is still `generation`, then tell its
    /// subscribers. Subscriptions are kept.
    fn fail_watch(&self, owner: &OwnerKey, generation: u64, reason: &str) {
        let Some((_, watch)) = self
            .watches
            .remove_if(owner, |_, watch| watch.generation == generation)
        else {
            debug!(owner = %owner, generation, "stale pump exited");
            return;
        };
        let _ = watch.handle.close();
        counter!(WATCH_FEED_FAILURES_TOTAL).increment(1);
        counter!(WATCHES_CLOSED_TOTAL).increment(1);
        gauge!(WATCHES_ACTIVE).decrement(1.0);
        warn!(owner = %owner, generation, reason, "watch failed, owner unwatched");

        let report = self
            .dispatcher
            .send(owner, &OutboundMessage::owner_error(owner, FEED_INTERRUPTED));
        debug!(notified = report.delivered, "subscribers told of feed failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::registry::ConnectionRegistry;
    use crate::broker::subscriptions::SubscriptionIndex;
    use serde_json::{Value, json};
    use tally_store::MemoryStore;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        store: MemoryStore,
        registry: Arc<ConnectionRegistry>,
        index: Arc<SubscriptionIndex>,
        watches: Arc<WatchManager>,
    }

    fn fixture(feed_timeout: Option<Duration>) -> Fixture {
        fixture_with(MemoryStore::new(), feed_timeout)
    }

    fn fixture_with(store: MemoryStore, feed_timeout: Option<Duration>) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(64));
        let index = Arc::new(SubscriptionIndex::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&index)));
        let shared: SharedStore = Arc::new(store.clone());
        let watches = Arc::new(WatchManager::new(shared, dispatcher, feed_timeout));
        Fixture {
            store,
            registry,
            index,
            watches,
        }
    }

    async fn recv_json(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        let raw = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn open_then_noop_then_stop() {
        let f = fixture(None);
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));

        assert!(f.watches.ensure_watching(&owner).await.unwrap());
        assert!(!f.watches.ensure_watching(&owner).await.unwrap());
        assert_eq!(f.watches.active_count(), 1);
        assert_eq!(f.store.open_feed_count(&owner), 1);

        assert!(f.watches.ensure_stopped(&owner));
        assert!(!f.watches.ensure_stopped(&owner));
        assert!(!f.watches.is_watching(&owner));
        assert_eq!(f.store.open_feed_count(&owner), 0);
    }

    #[tokio::test]
    async fn open_failure_leaves_unwatched() {
        let f = fixture(None);
        let owner = OwnerKey::from("ghost");
        let err = f.watches.ensure_watching(&owner).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!f.watches.is_watching(&owner));

        f.store.put_snapshot(&owner, json!({}));
        f.store.set_available(false);
        let err = f.watches.ensure_watching(&owner).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(f.watches.active_count(), 0);
    }

    #[tokio::test]
    async fn changes_reach_subscribers() {
        let f = fixture(None);
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({"total": 0}));
        let (id, mut rx) = f.registry.accept();
        let _ = recv_json(&mut rx).await;
        let _ = f.index.add(&owner, &id);
        let _ = f.watches.ensure_watching(&owner).await.unwrap();

        f.store.put_snapshot(&owner, json!({"total": 42}));
        let msg = recv_json(&mut rx).await;
        assert_eq!(msg["type"], "data_update");
        assert_eq!(msg["ownerKey"], "acct-1");
        assert_eq!(msg["payload"]["total"], 42);
    }

    #[tokio::test]
    async fn broken_feed_unwatches_and_notifies() {
        let f = fixture(None);
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let (id, mut rx) = f.registry.accept();
        let _ = recv_json(&mut rx).await;
        let _ = f.index.add(&owner, &id);
        let _ = f.watches.ensure_watching(&owner).await.unwrap();

        let _ = f.store.break_feeds(&owner, "replica lost");
        let msg = recv_json(&mut rx).await;
        assert_eq!(msg["type"], "error");
        assert_eq!(msg["ownerKey"], "acct-1");
        assert_eq!(msg["message"], FEED_INTERRUPTED);
        assert!(!f.watches.is_watching(&owner));
        // Subscriptions survive so a resubscribe can reopen.
        assert_eq!(f.index.subscriber_count(&owner), 1);

        assert!(f.watches.ensure_watching(&owner).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_feed_times_out() {
        let silent = MemoryStore::new().with_heartbeat_interval(None);
        let f = fixture_with(silent, Some(Duration::from_secs(5)));
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let _ = f.watches.ensure_watching(&owner).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        f.store.heartbeat(&owner);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(f.watches.is_watching(&owner));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!f.watches.is_watching(&owner));
        assert_eq!(f.store.open_feed_count(&owner), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_heartbeating_feed_outlives_timeout() {
        let f = fixture(Some(Duration::from_secs(30)));
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let (id, mut rx) = f.registry.accept();
        let _ = recv_json(&mut rx).await;
        let _ = f.index.add(&owner, &id);
        let _ = f.watches.ensure_watching(&owner).await.unwrap();

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(f.watches.is_watching(&owner));
        assert_eq!(f.store.open_feed_count(&owner), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_pump_cannot_remove_newer_watch() {
        let f = fixture(None);
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let _ = f.watches.ensure_watching(&owner).await.unwrap();
        let old_generation = f.watches.watches.get(&owner).unwrap().generation;

        assert!(f.watches.ensure_stopped(&owner));
        let _ = f.watches.ensure_watching(&owner).await.unwrap();

        f.watches.fail_watch(&owner, old_generation, "late failure");
        assert!(f.watches.is_watching(&owner));
    }

    #[tokio::test]
    async fn shutdown_closes_all() {
        let f = fixture(None);
        for key in ["a", "b", "c"] {
            let owner = OwnerKey::from(key);
            f.store.put_snapshot(&owner, json!({}));
            let _ = f.watches.ensure_watching(&owner).await.unwrap();
        }
        assert_eq!(f.watches.shutdown(), 3);
        assert_eq!(f.watches.active_count(), 0);
        assert_eq!(f.store.total_open_feeds(), 0);
    }
}
