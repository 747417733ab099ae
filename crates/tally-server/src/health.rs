//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::broker::BrokerStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"draining"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
    /// Owners with at least one subscriber.
    pub owners: usize,
    /// Open change feeds.
    pub watches: usize,
}

/// Build a health response from broker counters.
pub fn health_check(start_time: Instant, stats: BrokerStats, draining: bool) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.connections,
        owners: stats.owners,
        watches: stats.active_watches,
    }
}
