//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup
/// before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a private recorder (nothing global is installed).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "broker_connections_total";
/// Connections closed (counter).
pub const DISCONNECTIONS_TOTAL: &str = "broker_disconnections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "broker_connections_active";
/// Connection lifetime (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "broker_connection_duration_seconds";
/// Upgrades refused at the connection limit (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "broker_connections_rejected_total";
/// Connections closed for missing heartbeats (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "broker_heartbeat_timeouts_total";
/// Client requests handled (counter, labels: kind).
pub const MESSAGES_ROUTED_TOTAL: &str = "broker_messages_routed_total";
/// Client requests answered with an error (counter, labels: error).
pub const ROUTE_ERRORS_TOTAL: &str = "broker_route_errors_total";
/// Fan-outs performed (counter).
pub const BROADCASTS_TOTAL: &str = "broker_broadcasts_total";
/// Messages delivered by fan-out (counter).
pub const BROADCAST_DELIVERED_TOTAL: &str = "broker_broadcast_delivered_total";
/// Messages a fan-out could not deliver (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broker_broadcast_drops_total";
/// Watches opened (counter).
pub const WATCHES_OPENED_TOTAL: &str = "broker_watches_opened_total";
/// Watches closed for any reason (counter).
pub const WATCHES_CLOSED_TOTAL: &str = "broker_watches_closed_total";
/// Watch opens rejected by the store (counter, labels: error).
pub const WATCH_OPEN_FAILURES_TOTAL: &str = "broker_watch_open_failures_total";
/// Feeds that broke, closed or went silent while watched (counter).
pub const WATCH_FEED_FAILURES_TOTAL: &str = "broker_watch_feed_failures_total";
/// Active watches (gauge).
pub const WATCHES_ACTIVE: &str = "broker_watches_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_renders() {
        let handle = detached_handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            CONNECTION_DURATION_SECONDS,
            CONNECTIONS_REJECTED_TOTAL,
            HEARTBEAT_TIMEOUTS_TOTAL,
            MESSAGES_ROUTED_TOTAL,
            ROUTE_ERRORS_TOTAL,
            BROADCASTS_TOTAL,
            BROADCAST_DELIVERED_TOTAL,
            BROADCAST_DROPS_TOTAL,
            WATCHES_OPENED_TOTAL,
            WATCHES_CLOSED_TOTAL,
            WATCH_OPEN_FAILURES_TOTAL,
            WATCH_FEED_FAILURES_TOTAL,
            WATCHES_ACTIVE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
            assert!(name.starts_with("broker_"));
        }
    }
}
