//! `SQLite`-backed snapshot store with polling change feeds.
//!
//! Each feed runs a task that reads the owner's `version` every poll
//! interval. A successful poll with no change emits [`FeedEvent::Heartbeat`];
//! a higher version emits [`FeedEvent::Change`] with the new payload; a
//! query failure emits [`FeedEvent::Broken`] and ends the feed. Because the
//! feed reads the database itself, writes made by other processes are seen.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tally_core::OwnerKey;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::connection::{self, ConnectionConfig, ConnectionPool};
use super::migrations;
use crate::SnapshotStore;
use crate::errors::{Result, StoreError};
use crate::feed::{ChangeFeed, FeedEvent};

/// Default interval between version polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Snapshot store over a pooled `SQLite` database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: ConnectionPool,
    poll_interval: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and run migrations.
    pub fn open(path: &Path, config: &ConnectionConfig, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let pool = connection::new_file(path, config)?;
        Self::from_pool(pool, poll_interval)
    }

    /// Single-connection in-memory database (for tests).
    pub fn in_memory(poll_interval: Duration) -> Result<Self> {
        let pool = connection::new_in_memory(&ConnectionConfig::default())?;
        Self::from_pool(pool, poll_interval)
    }

    /// Wrap an existing pool, running migrations first.
    pub fn from_pool(pool: ConnectionPool, poll_interval: Duration) -> Result<Self> {
        let conn = pool.get()?;
        let _ = migrations::run_migrations(&conn)?;
        drop(conn);
        Ok(Self {
            pool,
            poll_interval,
        })
    }

    /// Insert or replace an owner's snapshot. Returns the new version.
    pub fn put_snapshot(&self, owner: &OwnerKey, payload: &Value) -> Result<i64> {
        let conn = self.pool.get()?;
        let body = serde_json::to_string(payload)?;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let version = conn.query_row(
            "INSERT INTO billing_snapshots (owner_key, payload, version, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(owner_key) DO UPDATE SET
                 payload = excluded.payload,
                 version = billing_snapshots.version + 1,
                 updated_at = excluded.updated_at
             RETURNING version",
            params![owner.as_str(), body, now],
            |row| row.get(0),
        )?;
        debug!(owner = %owner, version, "snapshot written");
        Ok(version)
    }

    /// Delete an owner's snapshot. Returns whether a row existed.
    pub fn delete_snapshot(&self, owner: &OwnerKey) -> Result<bool> {
        let conn = self.pool.get()?;
        let n = conn.execute(
            "DELETE FROM billing_snapshots WHERE owner_key = ?1",
            params![owner.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Number of owners with a stored snapshot.
    pub fn owner_count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM billing_snapshots", [], |row| {
            row.get(0)
        })?)
    }

    /// Run blocking database work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

fn read_version(conn: &Connection, owner: &OwnerKey) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT version FROM billing_snapshots WHERE owner_key = ?1",
            params![owner.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

fn read_snapshot(conn: &Connection, owner: &OwnerKey) -> Result<Option<(i64, Value)>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, payload FROM billing_snapshots WHERE owner_key = ?1",
            params![owner.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((version, body)) => Ok(Some((version, serde_json::from_str(&body)?))),
        None => Ok(None),
    }
}

/// Poll result for one tick.
enum Poll {
    Unchanged,
    Changed(i64, Value),
}

fn poll_once(conn: &Connection, owner: &OwnerKey, last_version: i64) -> Result<Poll> {
    match read_version(conn, owner)? {
        None => Err(StoreError::NotFound(owner.clone())),
        Some(v) if v <= last_version => Ok(Poll::Unchanged),
        Some(_) => match read_snapshot(conn, owner)? {
            Some((version, payload)) => Ok(Poll::Changed(version, payload)),
            None => Err(StoreError::NotFound(owner.clone())),
        },
    }
}

#[instrument(skip_all, fields(owner = %owner))]
async fn run_poller(
    pool: ConnectionPool,
    owner: OwnerKey,
    mut last_version: i64,
    interval: Duration,
    tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; the open already read the version.
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let poll_pool = pool.clone();
        let poll_owner = owner.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = poll_pool.get()?;
            poll_once(&conn, &poll_owner, last_version)
        })
        .await;

        let event = match result {
            Ok(Ok(Poll::Unchanged)) => FeedEvent::Heartbeat,
            Ok(Ok(Poll::Changed(version, payload))) => {
                last_version = version;
                FeedEvent::Change(payload)
            }
            Ok(Err(e)) => FeedEvent::Broken(e.to_string()),
            Err(e) => FeedEvent::Broken(format!("poll task failed: {e}")),
        };
        let broken = matches!(event, FeedEvent::Broken(_));
        if broken {
            warn!(?event, "change feed broken");
        }

        if matches!(event, FeedEvent::Heartbeat) {
            // Heartbeats are droppable; a backed-up consumer is still alive.
            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(event) {
                break;
            }
            continue;
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            sent = tx.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if broken {
            break;
        }
    }
    debug!("poller stopped");
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn open_change_feed(&self, owner: &OwnerKey) -> Result<ChangeFeed> {
        let lookup = owner.clone();
        let version = self
            .blocking(move |conn| read_version(conn, &lookup))
            .await?
            .ok_or_else(|| StoreError::NotFound(owner.clone()))?;

        let (tx, feed) = ChangeFeed::channel(owner.clone());
        let _poller = tokio::spawn(run_poller(
            self.pool.clone(),
            owner.clone(),
            version,
            self.poll_interval,
            tx,
            feed.handle.token(),
        ));
        debug!(owner = %owner, version, "sqlite feed opened");
        Ok(feed)
    }

    async fn fetch_snapshot(&self, owner: &OwnerKey) -> Result<Value> {
        let lookup = owner.clone();
        self.blocking(move |conn| read_snapshot(conn, &lookup))
            .await?
            .map(|(_, payload)| payload)
            .ok_or_else(|| StoreError::NotFound(owner.clone()))
    }
}
