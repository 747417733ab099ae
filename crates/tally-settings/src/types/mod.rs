//! Settings type definitions.
//!
//! All types use camelCase JSON field names and implement [`Default`] with
//! production values. `#[serde(default)]` lets a settings file specify only
//! the fields it wants to change.

mod server;
mod store;

pub use server::*;
pub use store::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the broker.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "store": { "backend": "sqlite", "dbPath": "/var/lib/tally/billing.db" },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallySettings {
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Backing store settings.
    pub store: StoreSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl TallySettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutMs ({}) must be >= server.heartbeatIntervalMs ({})",
                self.server.heartbeat_timeout_ms, self.server.heartbeat_interval_ms
            )));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be positive".into(),
            ));
        }
        if self.store.feed_timeout_ms != 0 && self.store.feed_timeout_ms <= self.store.poll_interval_ms
        {
            return Err(SettingsError::InvalidValue(format!(
                "store.feedTimeoutMs ({}) must exceed store.pollIntervalMs ({})",
                self.store.feed_timeout_ms, self.store.poll_interval_ms
            )));
        }
        Ok(())
    }
}

/// Log verbosity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level printed to stderr (overridden by `RUST_LOG`).
    pub level: LogLevel,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}
