//! Client configuration.

use hail_core::backoff::ReconnectPolicy;
use serde::{Deserialize, Serialize};

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default heartbeat send interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 20_000;
/// Default heartbeat liveness window in milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
/// Default outbound buffer depth while disconnected.
pub const DEFAULT_OUTBOUND_BUFFER_DEPTH: usize = 256;
/// Default duplicate-suppression window in milliseconds.
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 5000;
/// Default cap on simultaneously active offers.
pub const DEFAULT_ACTIVE_OFFER_CAPACITY: usize = 32;
/// Default completed-offer history capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

/// Settings for a dispatch client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9460/ws`.
    pub url: String,
    /// Credential presented in the `connect` handshake.
    pub auth_token: String,
    /// How long a dial may take before it counts as a failed attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Interval between application heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// The connection is considered lost when no `heartbeat:ack` arrives
    /// within this window.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Reconnection backoff parameters.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Events buffered while disconnected; the oldest is dropped (and
    /// counted) when full.
    #[serde(default = "default_outbound_buffer_depth")]
    pub outbound_buffer_depth: usize,
    /// Window within which a same-route offer counts as a duplicate.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: i64,
    /// Offers active at once before new ones are refused.
    #[serde(default = "default_active_offer_capacity")]
    pub active_offer_capacity: usize,
    /// Completed offers retained for statistics.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn default_heartbeat_timeout_ms() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_MS
}
fn default_outbound_buffer_depth() -> usize {
    DEFAULT_OUTBOUND_BUFFER_DEPTH
}
fn default_dedup_window_ms() -> i64 {
    DEFAULT_DEDUP_WINDOW_MS
}
fn default_active_offer_capacity() -> usize {
    DEFAULT_ACTIVE_OFFER_CAPACITY
}
fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl ClientConfig {
    /// Config with defaults for the given endpoint and credential.
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            reconnect: ReconnectPolicy::default(),
            outbound_buffer_depth: DEFAULT_OUTBOUND_BUFFER_DEPTH,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            active_offer_capacity: DEFAULT_ACTIVE_OFFER_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}
