//! The subscription broker.
//!
//! [`Broker`] owns one instance of each component and is the only entry
//! point transports use:
//!
//! - [`ConnectionRegistry`]: live connections and their outbound queues
//! - [`SubscriptionIndex`]: owner → subscribers
//! - [`WatchManager`]: one change feed per watched owner
//! - [`Dispatcher`]: fan-out to an owner's subscribers
//! - [`MessageRouter`]: request handling and disconnect cleanup
//!
//! Brokers share nothing process-wide, so several can run side by side.

pub mod dispatch;
pub mod owner_lock;
pub mod registry;
pub mod router;
pub mod subscriptions;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tally_core::{ConnectionId, OutboundMessage, OwnerKey};
use tally_store::SharedStore;
use tokio::sync::mpsc;

pub use dispatch::{DispatchReport, Dispatcher};
pub use owner_lock::OwnerLocks;
pub use registry::ConnectionRegistry;
pub use router::MessageRouter;
pub use subscriptions::SubscriptionIndex;
pub use watch::WatchManager;

/// Broker tuning.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Outbound queue depth per connection.
    pub send_queue_capacity: usize,
    /// Silence after which a change feed counts as broken.
    pub feed_timeout: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            feed_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Point-in-time broker statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Live connections.
    pub connections: usize,
    /// Owners with at least one subscriber.
    pub owners: usize,
    /// Open change feeds.
    pub active_watches: usize,
}

/// A complete broker instance.
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    index: Arc<SubscriptionIndex>,
    dispatcher: Arc<Dispatcher>,
    watches: Arc<WatchManager>,
    router: MessageRouter,
}

impl Broker {
    /// Build a broker over `store`.
    pub fn new(store: SharedStore, config: &BrokerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.send_queue_capacity));
        let index = Arc::new(SubscriptionIndex::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&index)));
        let watches = Arc::new(WatchManager::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            config.feed_timeout,
        ));
        let router = MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&index),
            Arc::clone(&watches),
            store,
        );
        Self {
            registry,
            index,
            dispatcher,
            watches,
            router,
        }
    }

    /// Register a new connection. The receiver yields serialized outbound
    /// messages, starting with `connection_established`.
    pub fn accept(&self) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        self.registry.accept()
    }

    /// Handle one raw client frame and queue the reply.
    pub async fn route(&self, id: &ConnectionId, raw: &str) {
        self.router.route(id, raw).await;
    }

    /// Handle one raw client frame and return the reply without queueing it.
    pub async fn handle(&self, id: &ConnectionId, raw: &str) -> OutboundMessage {
        self.router.handle(id, raw).await
    }

    /// Tear down a connection. Returns the number of watches closed.
    pub async fn disconnect(&self, id: &ConnectionId) -> usize {
        self.router.disconnect(id).await
    }

    /// Push a message to every subscriber of `owner`.
    pub fn broadcast(&self, owner: &OwnerKey, message: &OutboundMessage) -> DispatchReport {
        self.dispatcher.send(owner, message)
    }

    /// Current statistics.
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.registry.len(),
            owners: self.index.owner_count(),
            active_watches: self.watches.active_count(),
        }
    }

    /// Close every watch. Connections are left to their sessions.
    pub fn shutdown(&self) -> usize {
        self.watches.shutdown()
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Subscription index.
    pub fn index(&self) -> &Arc<SubscriptionIndex> {
        &self.index
    }

    /// Watch manager.
    pub fn watches(&self) -> &Arc<WatchManager> {
        &self.watches
    }

    /// Request router.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }
}
