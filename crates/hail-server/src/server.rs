//! `DispatchServer` — Axum HTTP + WebSocket server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServerConfig;
use crate::connections::ConnectionTable;
use crate::health::{self, HealthResponse};
use crate::matcher::{Matcher, RideStore};
use crate::registry::DriverRegistry;
use crate::session::{Authenticator, Gateway, run_ws_session};
use crate::shutdown::ShutdownCoordinator;

/// How often outstanding offers are swept for expiry.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Event router shared by all sessions.
    pub gateway: Arc<Gateway>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle, when metrics are installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The dispatch server.
pub struct DispatchServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl DispatchServer {
    /// Create a new server over the given ride store and authenticator.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RideStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let connections = Arc::new(ConnectionTable::new(config.max_connections));
        let registry = Arc::new(DriverRegistry::new());
        let matcher = Arc::new(Matcher::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            store,
            config.offer_ttl_secs,
            config.dispatch_retry_limit,
        ));
        let gateway = Arc::new(Gateway::new(connections, registry, matcher, auth, &config));
        Self {
            config,
            gateway,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Attach an installed Prometheus handle, enabling `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: Arc::clone(&self.gateway),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
    }

    /// Spawn the periodic offer-expiry sweep.
    ///
    /// Runs until shutdown; each tick releases lapsed reservations and
    /// re-dispatches their rides.
    pub fn spawn_expiry_sweep(&self) -> JoinHandle<()> {
        let gateway = Arc::clone(&self.gateway);
        let token = self.shutdown.token();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let expired = gateway.matcher.expire_outstanding(chrono::Utc::now()).await;
                        if !expired.is_empty() {
                            info!(count = expired.len(), "expired offers swept");
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
        })
    }

    /// Bind and serve until shutdown is signalled.
    pub async fn serve(&self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "dispatch server listening");

        let sweep = self.spawn_expiry_sweep();
        let token = self.shutdown.token();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        sweep.abort();
        result
    }

    /// Get the shared event router.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let resp = health::health_check(
        state.start_time,
        state.gateway.connections.count(),
        state.gateway.registry.available_count(),
        state.gateway.matcher.outstanding_count(),
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => crate::metrics::render(&handle).into_response(),
        None => (axum::http::StatusCode::NOT_FOUND, "metrics not enabled").into_response(),
    }
}

/// GET /ws — WebSocket upgrade into a dispatch session.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let gateway = Arc::clone(&state.gateway);
    let token = state.shutdown.token();
    ws.on_upgrade(move |socket| run_ws_session(socket, gateway, token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::RideStoreError;
    use crate::session::StaticTokenAuth;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hail_core::ids::{RideId, RiderId};
    use hail_core::protocol::RideState;
    use tower::ServiceExt;

    struct NullStore;

    #[async_trait]
    impl RideStore for NullStore {
        async fn create_ride(
            &self,
            _origin: &str,
            _destination: &str,
            _rider_id: &RiderId,
        ) -> Result<RideId, RideStoreError> {
            Ok(RideId::new())
        }

        async fn update_ride_status(
            &self,
            _ride_id: &RideId,
            _status: RideState,
        ) -> Result<(), RideStoreError> {
            Ok(())
        }
    }

    fn make_server() -> DispatchServer {
        DispatchServer::new(
            ServerConfig::default(),
            Arc::new(NullStore),
            Arc::new(StaticTokenAuth::new(["test-token"])),
        )
    }

    #[tokio::test]
    async fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
    }

    #[test]
    fn shutdown_coordinator_accessible() {
        let server = make_server();
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["drivers_available"], 0);
        assert_eq!(parsed["offers_outstanding"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_404_when_not_installed() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_route_rejects_plain_get() {
        let server = make_server();
        let app = server.router();

        // No upgrade headers: axum answers with an error, not a panic.
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_with_custom_config() {
        let config = ServerConfig {
            host: "0.0.0.0".into(),
            port: 9090,
            max_connections: 10,
            ..ServerConfig::default()
        };
        let server = DispatchServer::new(
            config,
            Arc::new(NullStore),
            Arc::new(StaticTokenAuth::new(["t"])),
        );
        assert_eq!(server.config().host, "0.0.0.0");
        assert_eq!(server.config().port, 9090);
        assert_eq!(server.config().max_connections, 10);
    }

    #[tokio::test]
    async fn shutdown_propagates_to_coordinator() {
        let server = make_server();
        let shutdown = Arc::clone(server.shutdown());
        assert!(!shutdown.is_shutting_down());
        shutdown.shutdown();
        assert!(server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn expiry_sweep_stops_on_shutdown() {
        let server = make_server();
        let handle = server.spawn_expiry_sweep();
        server.shutdown().shutdown();
        // The sweep task observes cancellation and exits on its own.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep did not stop")
            .unwrap();
    }
}
