//! Fan-out of one message to every subscriber of an owner.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tally_core::{OutboundMessage, OwnerKey};
use tracing::{debug, warn};

use super::registry::ConnectionRegistry;
use super::subscriptions::SubscriptionIndex;
use crate::metrics::{BROADCAST_DELIVERED_TOTAL, BROADCAST_DROPS_TOTAL, BROADCASTS_TOTAL};

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Subscribers at the time of the snapshot.
    pub recipients: usize,
    /// Messages queued successfully.
    pub delivered: usize,
    /// Recipients that were gone or backed up.
    pub dropped: usize,
}

/// Pushes messages to an owner's current subscribers.
///
/// Failed sends are counted and otherwise ignored. Subscriptions are only
/// cleaned up by disconnect, never by a failed send.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    index: Arc<SubscriptionIndex>,
}

impl Dispatcher {
    /// Create a dispatcher over shared registry and index.
    pub fn new(registry: Arc<ConnectionRegistry>, index: Arc<SubscriptionIndex>) -> Self {
        Self { registry, index }
    }

    /// Send `message` to every current subscriber of `owner`.
    pub fn send(&self, owner: &OwnerKey, message: &OutboundMessage) -> DispatchReport {
        let subscribers = self.index.subscribers(owner);
        if subscribers.is_empty() {
            return DispatchReport::default();
        }

        let json: Arc<str> = match message.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(owner = %owner, error = %e, "failed to serialize broadcast");
                return DispatchReport {
                    recipients: subscribers.len(),
                    delivered: 0,
                    dropped: subscribers.len(),
                };
            }
        };

        let mut report = DispatchReport {
            recipients: subscribers.len(),
            ..DispatchReport::default()
        };
        for id in &subscribers {
            if self.registry.send(id, Arc::clone(&json)) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }

        counter!(BROADCASTS_TOTAL).increment(1);
        counter!(BROADCAST_DELIVERED_TOTAL).increment(report.delivered as u64);
        if report.dropped > 0 {
            counter!(BROADCAST_DROPS_TOTAL).increment(report.dropped as u64);
            debug!(owner = %owner, dropped = report.dropped, "broadcast had undeliverable recipients");
        }
        report
    }
}
