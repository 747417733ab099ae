//! Process-local snapshot store with push-based change feeds.
//!
//! Writes through [`MemoryStore::put_snapshot`] are pushed straight to every
//! open feed for that owner. Each feed has a forwarder task that moves events
//! from an unbounded inbox into the bounded feed channel and emits periodic
//! heartbeats. Only heartbeats are ever skipped. Fault injection ([`MemoryStore::set_available`],
//! [`MemoryStore::break_feeds`]) lets tests drive the failure paths a real
//! backend would produce.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tally_core::OwnerKey;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::SnapshotStore;
use crate::errors::{Result, StoreError};
use crate::feed::{ChangeFeed, FEED_CAPACITY, FeedEvent, WatchHandle};

/// Heartbeat period for feeds of a [`MemoryStore::new`] store.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

struct FeedSlot {
    id: u64,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct Inner {
    snapshots: RwLock<HashMap<OwnerKey, Value>>,
    feeds: Mutex<HashMap<OwnerKey, Vec<FeedSlot>>>,
    unavailable: AtomicBool,
    next_feed_id: AtomicU64,
    feeds_opened: AtomicU64,
}

impl Inner {
    fn release_feed(&self, owner: &OwnerKey, id: u64) {
        let mut feeds = self.feeds.lock();
        if let Some(slots) = feeds.get_mut(owner) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                let _ = feeds.remove(owner);
            }
        }
    }

    /// Push `event` to every open feed for `owner`, dropping slots whose
    /// receiver is gone.
    fn notify(&self, owner: &OwnerKey, event: &FeedEvent) {
        let mut feeds = self.feeds.lock();
        let Some(slots) = feeds.get_mut(owner) else {
            return;
        };
        slots.retain(|slot| slot.tx.send(event.clone()).is_ok());
        if slots.is_empty() {
            let _ = feeds.remove(owner);
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            let _ = ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Move events from a feed's inbox to its consumer. Stops after a
/// `Broken` event or once either end goes away.
async fn forward(
    mut inbox: mpsc::UnboundedReceiver<FeedEvent>,
    outbound: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
    heartbeat: Option<Duration>,
) {
    let mut ticker = heartbeat.map(|every| {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            () = next_tick(&mut ticker) => {
                match outbound.try_send(FeedEvent::Heartbeat) {
                    Err(TrySendError::Closed(_)) => break,
                    Ok(()) | Err(TrySendError::Full(_)) => continue,
                }
            }
            event = inbox.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let broken = matches!(event, FeedEvent::Broken(_));
        tokio::select! {
            () = cancel.cancelled() => break,
            sent = outbound.send(event) => {
                if sent.is_err() || broken {
                    break;
                }
            }
        }
    }
}

/// In-memory [`SnapshotStore`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    heartbeat_interval: Option<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
        }
    }
}

impl MemoryStore {
    /// Create an empty store whose feeds heartbeat every
    /// [`DEFAULT_HEARTBEAT_INTERVAL`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat period for feeds opened afterwards. `None` leaves
    /// feeds silent between changes.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, every: Option<Duration>) -> Self {
        self.heartbeat_interval = every;
        self
    }

    /// Insert or replace an owner's snapshot and push it to open feeds.
    pub fn put_snapshot(&self, owner: &OwnerKey, payload: Value) {
        let _ = self
            .inner
            .snapshots
            .write()
            .insert(owner.clone(), payload.clone());
        self.inner.notify(owner, &FeedEvent::Change(payload));
    }

    /// Send a heartbeat on every open feed for `owner`.
    pub fn heartbeat(&self, owner: &OwnerKey) {
        self.inner.notify(owner, &FeedEvent::Heartbeat);
    }

    /// Toggle availability. While unavailable every open and fetch fails.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Report every open feed for `owner` as broken and detach them.
    pub fn break_feeds(&self, owner: &OwnerKey, reason: &str) -> usize {
        let slots = self.inner.feeds.lock().remove(owner).unwrap_or_default();
        for slot in &slots {
            let _ = slot.tx.send(FeedEvent::Broken(reason.to_string()));
        }
        slots.len()
    }

    /// Number of feeds currently registered for `owner`.
    pub fn open_feed_count(&self, owner: &OwnerKey) -> usize {
        self.inner.feeds.lock().get(owner).map_or(0, Vec::len)
    }

    /// Number of feeds registered across all owners.
    pub fn total_open_feeds(&self) -> usize {
        self.inner.feeds.lock().values().map(Vec::len).sum()
    }

    /// Total feeds ever opened.
    pub fn feeds_opened(&self) -> u64 {
        self.inner.feeds_opened.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn open_change_feed(&self, owner: &OwnerKey) -> Result<ChangeFeed> {
        self.check_available()?;
        if !self.inner.snapshots.read().contains_key(owner) {
            return Err(StoreError::NotFound(owner.clone()));
        }

        let id = self.inner.next_feed_id.fetch_add(1, Ordering::Relaxed);
        let (tx, inbox) = mpsc::unbounded_channel();
        let (outbound, events) = mpsc::channel(FEED_CAPACITY);
        self.inner
            .feeds
            .lock()
            .entry(owner.clone())
            .or_default()
            .push(FeedSlot { id, tx });
        let _ = self.inner.feeds_opened.fetch_add(1, Ordering::SeqCst);
        debug!(owner = %owner, feed_id = id, "memory feed opened");

        let inner = Arc::clone(&self.inner);
        let release_owner = owner.clone();
        let handle = WatchHandle::new(owner.clone()).with_release(move || {
            inner.release_feed(&release_owner, id);
        });
        let _forwarder = tokio::spawn(forward(
            inbox,
            outbound,
            handle.token(),
            self.heartbeat_interval,
        ));
        Ok(ChangeFeed { events, handle })
    }

    async fn fetch_snapshot(&self, owner: &OwnerKey) -> Result<Value> {
        self.check_available()?;
        self.inner
            .snapshots
            .read()
            .get(owner)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(owner.clone()))
    }
}
