//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at server startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Outbound frame drops on full per-client queues (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Handshake credential rejections (counter).
pub const AUTH_FAILURES_TOTAL: &str = "auth_failures_total";
/// Inbound frames that failed to parse (counter).
pub const MALFORMED_FRAMES_TOTAL: &str = "malformed_frames_total";
/// Inbound events by wire name (counter, labels: event).
pub const EVENTS_RECEIVED_TOTAL: &str = "events_received_total";
/// Drivers currently available (gauge).
pub const DRIVERS_AVAILABLE: &str = "drivers_available";
/// Ride requests received (counter).
pub const DISPATCH_REQUESTS_TOTAL: &str = "dispatch_requests_total";
/// Offers sent to drivers (counter).
pub const DISPATCH_OFFERS_TOTAL: &str = "dispatch_offers_total";
/// Requests that found no driver (counter).
pub const DISPATCH_NO_DRIVERS_TOTAL: &str = "dispatch_no_drivers_total";
/// Offer resolutions by outcome (counter, labels: outcome).
pub const OFFER_OUTCOMES_TOTAL: &str = "offer_outcomes_total";
