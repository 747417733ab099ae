//! Server configuration.

use std::time::Duration;

use tally_settings::TallySettings;

use crate::broker::BrokerConfig;

/// Configuration for the broker server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server Ping frames.
    pub heartbeat_interval: Duration,
    /// Disconnect a client silent for this long.
    pub heartbeat_timeout: Duration,
    /// Per-connection outbound queue depth.
    pub send_queue_capacity: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Treat a change feed silent for this long as broken. `None` disables.
    pub feed_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            send_queue_capacity: 256,
            max_message_size: 64 * 1024,
            feed_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ServerConfig {
    /// Derive server configuration from loaded settings.
    pub fn from_settings(settings: &TallySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(server.heartbeat_timeout_ms),
            send_queue_capacity: server.send_queue_capacity,
            max_message_size: server.max_message_size,
            feed_timeout: match settings.store.feed_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    /// Broker tuning implied by this configuration.
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            send_queue_capacity: self.send_queue_capacity,
            feed_timeout: self.feed_timeout,
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_zero() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn from_settings_converts_units() {
        let mut settings = TallySettings::default();
        settings.server.port = 9100;
        settings.server.heartbeat_interval_ms = 1_500;
        settings.store.feed_timeout_ms = 4_000;
        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(1_500));
        assert_eq!(cfg.feed_timeout, Some(Duration::from_secs(4)));
    }

    #[test]
    fn zero_feed_timeout_disables() {
        let mut settings = TallySettings::default();
        settings.store.feed_timeout_ms = 0;
        assert_eq!(ServerConfig::from_settings(&settings).feed_timeout, None);
    }

    #[test]
    fn broker_config_follows_server_config() {
        let cfg = ServerConfig {
            send_queue_capacity: 8,
            feed_timeout: None,
            ..ServerConfig::default()
        };
        let broker = cfg.broker_config();
        assert_eq!(broker.send_queue_capacity, 8);
        assert_eq!(broker.feed_timeout, None);
    }
}
