//! Network and connection settings.

use serde::{Deserialize, Serialize};

/// WebSocket/HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`/ws`, `/health`, `/stats` and `/metrics` share it).
    pub port: u16,
    /// Upgrades beyond this many live connections are refused with 503.
    pub max_connections: usize,
    /// Interval between server Ping frames.
    pub heartbeat_interval_ms: u64,
    /// A client silent for longer than this is disconnected.
    pub heartbeat_timeout_ms: u64,
    /// Outbound queue depth per connection before messages are dropped.
    pub send_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_connections: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}
