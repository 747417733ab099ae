//! # tally-store
//!
//! The backing-store collaborator the broker watches.
//!
//! A [`SnapshotStore`] does two things: open a [`ChangeFeed`] filtered to one
//! owner, and read an owner's current snapshot once. Two implementations ship:
//!
//! - [`MemoryStore`]: process-local, push-based, with fault injection for tests
//! - [`SqliteStore`]: pooled `SQLite` file whose feeds poll a version column

#![deny(unsafe_code)]

pub mod errors;
pub mod feed;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::OwnerKey;

pub use errors::{Result, StoreError};
pub use feed::{ChangeFeed, FeedEvent, WatchHandle};
pub use memory::MemoryStore;
pub use sqlite::{ConnectionConfig, SqliteStore};

/// Source of billing snapshots and their change feeds.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Open a feed of changes to `owner`'s snapshot.
    ///
    /// Fails with [`StoreError::NotFound`] for an unknown owner and an
    /// unavailable-class error when the store cannot be reached. Only changes
    /// made after the feed opens are delivered.
    async fn open_change_feed(&self, owner: &OwnerKey) -> Result<ChangeFeed>;

    /// Read `owner`'s current snapshot.
    async fn fetch_snapshot(&self, owner: &OwnerKey) -> Result<Value>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn SnapshotStore>;
