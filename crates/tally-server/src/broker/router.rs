//! Client request handling: subscribe, unsubscribe, fetch-once and
//! disconnect cleanup.
//!
//! Every transition that checks the index and then opens or closes a watch
//! runs under the owner's lock from [`OwnerLocks`].

use std::sync::Arc;

use metrics::counter;
use tally_core::{ConnectionId, InboundMessage, OutboundMessage, OwnerKey};
use tally_store::SharedStore;
use tracing::{debug, info};

use super::owner_lock::OwnerLocks;
use super::registry::ConnectionRegistry;
use super::subscriptions::SubscriptionIndex;
use super::watch::WatchManager;
use crate::errors::BrokerError;
use crate::metrics::{MESSAGES_ROUTED_TOTAL, ROUTE_ERRORS_TOTAL};

/// Routes parsed client requests to the broker components.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    index: Arc<SubscriptionIndex>,
    watches: Arc<WatchManager>,
    locks: OwnerLocks,
    store: SharedStore,
}

impl MessageRouter {
    /// Create a router over shared components.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        index: Arc<SubscriptionIndex>,
        watches: Arc<WatchManager>,
        store: SharedStore,
    ) -> Self {
        Self {
            registry,
            index,
            watches,
            locks: OwnerLocks::new(),
            store,
        }
    }

    /// Handle one raw frame from `id` and queue the reply to it.
    pub async fn route(&self, id: &ConnectionId, raw: &str) {
        let reply = self.handle(id, raw).await;
        if !self.registry.send_message(id, &reply) {
            debug!(conn_id = %id, "reply not delivered");
        }
    }

    /// Handle one raw frame from `id` and return the reply.
    pub async fn handle(&self, id: &ConnectionId, raw: &str) -> OutboundMessage {
        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => return Self::reject(id, &BrokerError::from(e), None),
        };
        counter!(MESSAGES_ROUTED_TOTAL, "kind" => message.kind()).increment(1);

        let owner = message.owner_key().clone();
        let result = match &message {
            InboundMessage::Subscribe { owner_key } => self.subscribe(id, owner_key).await,
            InboundMessage::Unsubscribe { owner_key } => Ok(self.unsubscribe(id, owner_key).await),
            InboundMessage::FetchOnce { owner_key } => self.fetch_once(owner_key).await,
        };
        result.unwrap_or_else(|e| Self::reject(id, &e, Some(&owner)))
    }

    /// Subscribe `id` to `owner`, opening the owner's watch if it has none.
    ///
    /// A failed open undoes the subscription.
    pub async fn subscribe(
        &self,
        id: &ConnectionId,
        owner: &OwnerKey,
    ) -> Result<OutboundMessage, BrokerError> {
        let guard = self.locks.acquire(owner).await;
        let already = self.index.contains(owner, id);
        let is_first = self.index.add(owner, id);

        // A disconnect may have cleaned this connection up before the add
        // landed; the add must not outlive it.
        if !self.registry.contains(id) {
            if self.index.remove(owner, id) {
                let _ = self.watches.ensure_stopped(owner);
                guard.retire();
            }
            return Err(BrokerError::ConnectionClosed);
        }

        if is_first || !self.watches.is_watching(owner) {
            if let Err(e) = self.watches.ensure_watching(owner).await {
                if !already && self.index.remove(owner, id) {
                    guard.retire();
                }
                return Err(e.into());
            }
        }

        info!(conn_id = %id, owner = %owner, is_first, "subscribed");
        Ok(OutboundMessage::subscribed(owner))
    }

    /// Unsubscribe `id` from `owner`, closing the watch on the last one.
    /// Always acknowledged.
    pub async fn unsubscribe(&self, id: &ConnectionId, owner: &OwnerKey) -> OutboundMessage {
        let guard = self.locks.acquire(owner).await;
        if self.index.remove(owner, id) {
            let _ = self.watches.ensure_stopped(owner);
            guard.retire();
        }
        debug!(conn_id = %id, owner = %owner, "unsubscribed");
        OutboundMessage::unsubscribed(owner)
    }

    /// Read `owner`'s snapshot without touching subscriptions or watches.
    pub async fn fetch_once(&self, owner: &OwnerKey) -> Result<OutboundMessage, BrokerError> {
        let payload = self.store.fetch_snapshot(owner).await?;
        Ok(OutboundMessage::snapshot(owner, payload))
    }

    /// Remove `id` from the registry and every subscription, stopping the
    /// watch of each owner left without subscribers.
    ///
    /// Returns the number of watches closed.
    pub async fn disconnect(&self, id: &ConnectionId) -> usize {
        let _ = self.registry.remove(id);
        let emptied = self.index.remove_connection_everywhere(id);
        let mut closed = 0;
        for owner in &emptied {
            let guard = self.locks.acquire(owner).await;
            // A subscribe may have refilled the owner while we waited.
            if self.index.subscriber_count(owner) == 0 {
                if self.watches.ensure_stopped(owner) {
                    closed += 1;
                }
                guard.retire();
            }
        }
        debug!(conn_id = %id, owners = emptied.len(), closed, "connection cleaned up");
        closed
    }

    /// Owners with a live lock (diagnostics).
    pub fn locked_owner_count(&self) -> usize {
        self.locks.len()
    }

    fn reject(
        id: &ConnectionId,
        error: &BrokerError,
        owner: Option<&OwnerKey>,
    ) -> OutboundMessage {
        counter!(ROUTE_ERRORS_TOTAL, "error" => error.kind()).increment(1);
        debug!(conn_id = %id, error = %error, "request rejected");
        error.to_message(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::dispatch::Dispatcher;
    use serde_json::{Value, json};
    use tally_core::OutboundKind;
    use tally_store::MemoryStore;
    use tokio::sync::mpsc;

    struct Fixture {
        store: MemoryStore,
        registry: Arc<ConnectionRegistry>,
        index: Arc<SubscriptionIndex>,
        watches: Arc<WatchManager>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        let registry = Arc::new(ConnectionRegistry::new(64));
        let index = Arc::new(SubscriptionIndex::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&index)));
        let watches = Arc::new(WatchManager::new(Arc::clone(&shared), dispatcher, None));
        let router = MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&index),
            Arc::clone(&watches),
            shared,
        );
        Fixture {
            store,
            registry,
            index,
            watches,
            router,
        }
    }

    fn subscribe(owner: &str) -> String {
        json!({"type": "subscribe", "ownerKey": owner}).to_string()
    }

    fn unsubscribe(owner: &str) -> String {
        json!({"type": "unsubscribe", "ownerKey": owner}).to_string()
    }

    fn fetch_once(owner: &str) -> String {
        json!({"type": "fetch-once", "ownerKey": owner}).to_string()
    }

    fn connect(f: &Fixture) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let (id, mut rx) = f.registry.accept();
        let _ = rx.try_recv();
        (id, rx)
    }

    #[tokio::test]
    async fn malformed_frame_gets_error() {
        let f = fixture();
        let (id, _rx) = connect(&f);
        let reply = f.router.handle(&id, "{not json").await;
        assert_eq!(reply.kind, OutboundKind::Error);
        assert!(reply.message.unwrap().starts_with("invalid message format"));
        assert!(reply.owner_key.is_none());
    }

    #[tokio::test]
    async fn unknown_type_named_in_error() {
        let f = fixture();
        let (id, _rx) = connect(&f);
        let reply = f
            .router
            .handle(&id, r#"{"type":"explode","ownerKey":"acct-1"}"#)
            .await;
        assert_eq!(reply.message.as_deref(), Some("unknown message type: explode"));
    }

    #[tokio::test]
    async fn subscribe_opens_one_watch() {
        let f = fixture();
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let (c1, _r1) = connect(&f);
        let (c2, _r2) = connect(&f);

        let reply = f.router.handle(&c1, &subscribe("acct-1")).await;
        assert_eq!(reply.kind, OutboundKind::Subscribed);
        assert_eq!(reply.owner_key, Some(owner.clone()));
        let _ = f.router.handle(&c2, &subscribe("acct-1")).await;

        assert_eq!(f.watches.active_count(), 1);
        assert_eq!(f.store.feeds_opened(), 1);
        assert_eq!(f.index.subscriber_count(&owner), 2);
    }

    #[tokio::test]
    async fn subscribe_unknown_owner_undoes_add() {
        let f = fixture();
        let (id, _rx) = connect(&f);
        let reply = f.router.handle(&id, &subscribe("ghost")).await;
        assert_eq!(reply.kind, OutboundKind::Error);
        assert_eq!(reply.owner_key.as_ref().map(OwnerKey::as_str), Some("ghost"));
        assert_eq!(f.index.owner_count(), 0);
        assert_eq!(f.watches.active_count(), 0);
        assert_eq!(f.router.locked_owner_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_while_unavailable_leaves_unwatched() {
        let f = fixture();
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        f.store.set_available(false);
        let (id, _rx) = connect(&f);

        let reply = f.router.handle(&id, &subscribe("acct-1")).await;
        assert!(reply.message.unwrap().starts_with("store unavailable"));
        assert!(!f.watches.is_watching(&owner));
        assert_eq!(f.index.owner_count(), 0);

        // No automatic retry; the next subscribe tries again.
        f.store.set_available(true);
        let reply = f.router.handle(&id, &subscribe("acct-1")).await;
        assert_eq!(reply.kind, OutboundKind::Subscribed);
        assert!(f.watches.is_watching(&owner));
    }

    #[tokio::test]
    async fn resubscribe_after_feed_failure_reopens() {
        let f = fixture();
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let (id, mut rx) = connect(&f);
        let _ = f.router.handle(&id, &subscribe("acct-1")).await;

        let _ = f.store.break_feeds(&owner, "lost");
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let msg: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(msg["type"], "error");
        assert!(!f.watches.is_watching(&owner));

        let reply = f.router.handle(&id, &subscribe("acct-1")).await;
        assert_eq!(reply.kind, OutboundKind::Subscribed);
        assert!(f.watches.is_watching(&owner));
        assert_eq!(f.store.feeds_opened(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_last_closes_watch() {
        let f = fixture();
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let (c1, _r1) = connect(&f);
        let (c2, _r2) = connect(&f);
        let _ = f.router.handle(&c1, &subscribe("acct-1")).await;
        let _ = f.router.handle(&c2, &subscribe("acct-1")).await;

        let reply = f.router.handle(&c1, &unsubscribe("acct-1")).await;
        assert_eq!(reply.kind, OutboundKind::Unsubscribed);
        assert!(f.watches.is_watching(&owner));

        let _ = f.router.handle(&c2, &unsubscribe("acct-1")).await;
        assert!(!f.watches.is_watching(&owner));
        assert_eq!(f.store.open_feed_count(&owner), 0);
        assert_eq!(f.router.locked_owner_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_never_subscribed_is_acknowledged() {
        let f = fixture();
        let (id, _rx) = connect(&f);
        let reply = f.router.handle(&id, &unsubscribe("acct-7")).await;
        assert_eq!(reply.kind, OutboundKind::Unsubscribed);
        assert_eq!(f.index.owner_count(), 0);
        assert_eq!(f.watches.active_count(), 0);
    }

    #[tokio::test]
    async fn fetch_once_reads_without_side_effects() {
        let f = fixture();
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({"total": 99}));
        let (id, _rx) = connect(&f);

        let reply = f.router.handle(&id, &fetch_once("acct-1")).await;
        assert_eq!(reply.kind, OutboundKind::Snapshot);
        assert_eq!(reply.payload.unwrap()["total"], 99);
        assert_eq!(f.index.owner_count(), 0);
        assert_eq!(f.watches.active_count(), 0);
    }

    #[tokio::test]
    async fn fetch_once_unknown_owner() {
        let f = fixture();
        let (id, _rx) = connect(&f);
        let reply = f.router.handle(&id, &fetch_once("ghost")).await;
        assert_eq!(reply.kind, OutboundKind::Error);
        assert_eq!(reply.message.as_deref(), Some("owner not found: ghost"));
        assert_eq!(f.index.owner_count(), 0);
        assert_eq!(f.watches.active_count(), 0);
    }

    #[tokio::test]
    async fn route_queues_reply() {
        let f = fixture();
        let (id, mut rx) = connect(&f);
        f.router.route(&id, "garbage").await;
        let msg: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "error");
    }

    #[tokio::test]
    async fn subscribe_from_removed_connection_is_undone() {
        let f = fixture();
        let owner = OwnerKey::from("acct-1");
        f.store.put_snapshot(&owner, json!({}));
        let (id, _rx) = connect(&f);
        let _ = f.registry.remove(&id);

        let reply = f.router.handle(&id, &subscribe("acct-1")).await;
        assert_eq!(reply.message.as_deref(), Some("connection closed"));
        assert_eq!(f.index.owner_count(), 0);
        assert_eq!(f.watches.active_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_closes_sole_subscriber_watches_once() {
        let f = fixture();
        for key in ["solo-a", "solo-b", "shared"] {
            f.store.put_snapshot(&OwnerKey::from(key), json!({}));
        }
        let (c1, _r1) = connect(&f);
        let (c2, _r2) = connect(&f);
        for key in ["solo-a", "solo-b", "shared"] {
            let _ = f.router.handle(&c1, &subscribe(key)).await;
        }
        let _ = f.router.handle(&c2, &subscribe("shared")).await;
        assert_eq!(f.watches.active_count(), 3);

        assert_eq!(f.router.disconnect(&c1).await, 2);
        assert!(!f.registry.contains(&c1));
        assert!(f.index.owners_of(&c1).is_empty());
        assert_eq!(f.watches.watched_owners(), vec![OwnerKey::from("shared")]);
        assert_eq!(f.router.disconnect(&c1).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribe_storm_opens_single_watch() {
        let f = Arc::new(fixture());
        let owner = OwnerKey::from("hot");
        f.store.put_snapshot(&owner, json!({}));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let f = Arc::clone(&f);
                tokio::spawn(async move {
                    let (id, rx) = connect(&f);
                    let reply = f.router.handle(&id, &subscribe("hot")).await;
                    (reply.kind, rx)
                })
            })
            .collect();
        let mut receivers = Vec::new();
        for task in tasks {
            let (kind, rx) = task.await.unwrap();
            assert_eq!(kind, OutboundKind::Subscribed);
            receivers.push(rx);
        }
        assert_eq!(f.store.feeds_opened(), 1);
        assert_eq!(f.watches.active_count(), 1);
        assert_eq!(f.index.subscriber_count(&owner), 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribe_racing_disconnect_never_orphans_watch() {
        let f = Arc::new(fixture());
        for round in 0..50 {
            let key = format!("race-{round}");
            let owner = OwnerKey::from(key.as_str());
            f.store.put_snapshot(&owner, json!({}));
            let (id, _rx) = connect(&f);

            let sub = {
                let f = Arc::clone(&f);
                let id = id.clone();
                let key = key.clone();
                tokio::spawn(async move { f.router.handle(&id, &subscribe(&key)).await })
            };
            let disc = {
                let f = Arc::clone(&f);
                let id = id.clone();
                tokio::spawn(async move { f.router.disconnect(&id).await })
            };
            let _ = sub.await.unwrap();
            let _ = disc.await.unwrap();

            assert_eq!(f.index.subscriber_count(&owner), 0, "round {round}");
            assert!(!f.watches.is_watching(&owner), "round {round}");
        }
        assert_eq!(f.store.total_open_feeds(), 0);
    }
}
