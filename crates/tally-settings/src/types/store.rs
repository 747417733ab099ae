//! Backing store settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which snapshot store implementation to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; snapshots vanish on exit.
    Memory,
    /// File-backed SQLite store polled for changes.
    #[default]
    Sqlite,
}

impl StoreBackend {
    /// Parse a backend name (case-insensitive).
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "memory" | "mem" => Some(Self::Memory),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Snapshot store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Store implementation.
    pub backend: StoreBackend,
    /// SQLite database path. Empty means `~/.tally/billing.db`.
    pub db_path: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// How often a SQLite change feed polls the owner's version. Memory
    /// feeds heartbeat at the same period.
    pub poll_interval_ms: u64,
    /// A feed with no event or heartbeat for this long is treated as broken.
    /// `0` disables the check.
    pub feed_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            db_path: String::new(),
            pool_size: 4,
            poll_interval_ms: 500,
            feed_timeout_ms: 30_000,
        }
    }
}

impl StoreSettings {
    /// Resolved database path.
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.is_empty() {
            crate::loader::tally_home().join("billing.db")
        } else {
            PathBuf::from(&self.db_path)
        }
    }
}
