//! Change feeds and the handles that own them.
//!
//! A [`ChangeFeed`] pairs an event receiver with the [`WatchHandle`] that
//! keeps the producer registered. Closing the handle (explicitly or by
//! dropping it) cancels the producer and runs its release hook exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tally_core::OwnerKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered events per feed. A producer that finds it full skips heartbeats
/// and waits to deliver anything else.
pub const FEED_CAPACITY: usize = 64;

/// One item delivered by a change feed.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// The owner's snapshot changed; carries the new payload.
    Change(Value),
    /// The feed is alive but nothing changed.
    Heartbeat,
    /// The feed failed and will produce nothing further.
    Broken(String),
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Registration of a live change feed.
pub struct WatchHandle {
    owner: OwnerKey,
    cancel: CancellationToken,
    closed: AtomicBool,
    release: Mutex<Option<ReleaseFn>>,
}

impl WatchHandle {
    /// Create an open handle for `owner`.
    pub fn new(owner: OwnerKey) -> Self {
        Self {
            owner,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            release: Mutex::new(None),
        }
    }

    /// Attach a hook run once when the handle closes.
    #[must_use]
    pub fn with_release(self, release: impl FnOnce() + Send + 'static) -> Self {
        *self.release.lock() = Some(Box::new(release));
        self
    }

    /// Token cancelled when the handle closes. Producers select on it.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the feed. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        if let Some(release) = self.release.lock().take() {
            release();
        }
        true
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("owner", &self.owner)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A live change feed for one owner.
#[derive(Debug)]
pub struct ChangeFeed {
    /// Events in the order the store observed them.
    pub events: mpsc::Receiver<FeedEvent>,
    /// Closing this stops the producer.
    pub handle: WatchHandle,
}

impl ChangeFeed {
    /// Create a feed and the sender its producer writes to.
    pub fn channel(owner: OwnerKey) -> (mpsc::Sender<FeedEvent>, Self) {
        let (tx, events) = mpsc::channel(FEED_CAPACITY);
        let feed = Self {
            events,
            handle: WatchHandle::new(owner),
        };
        (tx, feed)
    }
}
