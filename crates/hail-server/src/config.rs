//! Server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the hail dispatch server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server-initiated Ping frames, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without any liveness signal.
    pub heartbeat_timeout_secs: u64,
    /// How long a dispatched offer stays actionable, in seconds.
    pub offer_ttl_secs: i64,
    /// How many alternate drivers to try when a send fails mid-dispatch.
    pub dispatch_retry_limit: u32,
    /// Per-connection outbound frame queue depth.
    pub send_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 500,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            offer_ttl_secs: 30,
            dispatch_retry_limit: 3,
            send_queue_depth: 256,
        }
    }
}
