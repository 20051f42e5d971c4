//! WebSocket session lifecycle — handles a single connected client from
//! upgrade through disconnect.
//!
//! The first frame must be `connect`; anything else, or a rejected
//! credential, ends the session with a `disconnect` frame before any other
//! event is processed. After the handshake the session routes events
//! through the shared [`Gateway`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use hail_core::ids::ConnectionId;
use hail_core::protocol::{
    ConnectAckPayload, DisconnectPayload, DisconnectReason, Event, HeartbeatPayload,
    RideNoDriversPayload,
};

use crate::config::ServerConfig;
use crate::connections::{ClientConnection, ConnectionTable};
use crate::matcher::{DispatchOutcome, Matcher};
use crate::registry::DriverRegistry;

/// Interval between server-initiated Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before considering the client dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the client has to send its `connect` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Credential check performed before a connection is registered.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Whether the presented token grants a connection.
    async fn authenticate(&self, token: &str) -> bool;
}

/// Accepts tokens from a fixed allow-list.
pub struct StaticTokenAuth {
    tokens: HashSet<String>,
}

impl StaticTokenAuth {
    /// Build from the accepted token values.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

/// What the session loop should do after an event is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionControl {
    /// Keep reading frames.
    Continue,
    /// Close the connection.
    Close(DisconnectReason),
}

/// Shared event router for all authenticated sessions.
pub struct Gateway {
    /// Registered connections.
    pub connections: Arc<ConnectionTable>,
    /// Driver availability state.
    pub registry: Arc<DriverRegistry>,
    /// Ride dispatch.
    pub matcher: Arc<Matcher>,
    /// Handshake credential check.
    pub auth: Arc<dyn Authenticator>,
    /// Liveness window for application heartbeats.
    pub heartbeat_timeout: Duration,
}

impl Gateway {
    /// Assemble the gateway from the shared server state.
    pub fn new(
        connections: Arc<ConnectionTable>,
        registry: Arc<DriverRegistry>,
        matcher: Arc<Matcher>,
        auth: Arc<dyn Authenticator>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            connections,
            registry,
            matcher,
            auth,
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
        }
    }

    /// Route one post-handshake event from `conn_id`.
    pub async fn handle_event(&self, conn_id: &ConnectionId, event: Event) -> SessionControl {
        counter!("events_received_total", "event" => event.name()).increment(1);
        match event {
            Event::Heartbeat(HeartbeatPayload { seq }) => {
                if let Some(conn) = self.connections.get(conn_id).await {
                    conn.mark_alive();
                }
                let _ = self
                    .connections
                    .send_event_to(conn_id, &Event::HeartbeatAck(HeartbeatPayload { seq }))
                    .await;
            }
            Event::DriverAvailable(payload) => {
                self.registry
                    .register_available(conn_id, payload.driver_id, payload.location);
                gauge!("drivers_available").set(self.registry.available_count() as f64);
            }
            Event::DriverUnavailable(payload) => {
                debug!(conn_id = %conn_id, driver_id = %payload.driver_id, "driver going off duty");
                self.registry.register_unavailable(conn_id);
                gauge!("drivers_available").set(self.registry.available_count() as f64);
            }
            Event::RideRequest(payload) => match self.matcher.dispatch(conn_id, &payload).await {
                Ok(DispatchOutcome::Offered { .. }) => {}
                Ok(DispatchOutcome::NoDrivers { ride_id }) => {
                    let _ = self
                        .connections
                        .send_event_to(conn_id, &Event::RideNoDrivers(RideNoDriversPayload { ride_id }))
                        .await;
                }
                Err(err) => {
                    warn!(conn_id = %conn_id, error = %err, "dispatch failed");
                }
            },
            Event::RideAccept(payload) => {
                if let Err(err) = self
                    .matcher
                    .resolve(&payload.offer_id, &payload.responder_id, true)
                    .await
                {
                    warn!(offer_id = %payload.offer_id, error = %err, "accept failed");
                }
                gauge!("drivers_available").set(self.registry.available_count() as f64);
            }
            Event::RideReject(payload) => {
                if let Err(err) = self
                    .matcher
                    .resolve(&payload.offer_id, &payload.responder_id, false)
                    .await
                {
                    warn!(offer_id = %payload.offer_id, error = %err, "reject failed");
                }
            }
            Event::Disconnect(_) => {
                return SessionControl::Close(DisconnectReason::ClientRequest);
            }
            // Server-to-client events are not valid inbound.
            Event::Connect(_)
            | Event::ConnectAck(_)
            | Event::HeartbeatAck(_)
            | Event::RideIncoming(_)
            | Event::RideAssigned(_)
            | Event::RideNoDrivers(_)
            | Event::RideStatus(_) => {
                warn!(conn_id = %conn_id, event = event.name(), "unexpected inbound event");
            }
        }
        SessionControl::Continue
    }

    /// Tear down all state for a departed connection.
    pub async fn on_disconnect(&self, conn_id: &ConnectionId) {
        self.registry.on_disconnect(conn_id);
        self.connections.remove(conn_id).await;
        gauge!("drivers_available").set(self.registry.available_count() as f64);
    }
}

/// Extract a text payload from a frame, marking liveness on Ping/Pong.
fn frame_text(msg: Message, conn: &ClientConnection) -> Result<Option<String>, ()> {
    match msg {
        Message::Text(t) => Ok(Some(t.to_string())),
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(s) => Ok(Some(s.to_owned())),
            Err(_) => {
                info!(conn_id = %conn.id, len = data.len(), "non-UTF8 binary frame ignored");
                Ok(None)
            }
        },
        Message::Close(_) => Err(()),
        Message::Ping(_) | Message::Pong(_) => {
            conn.mark_alive();
            Ok(None)
        }
    }
}

/// Run a WebSocket session: handshake, register, route, clean up.
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(ws: WebSocket, gateway: Arc<Gateway>, shutdown: CancellationToken) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    // Auth-first: nothing is registered until the connect frame passes.
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_rx.next()).await;
    let token = match handshake {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<Event>(&text) {
            Ok(Event::Connect(payload)) => payload.auth_token,
            Ok(other) => {
                warn!(event = other.name(), "first frame was not connect");
                send_disconnect(&mut ws_tx, DisconnectReason::AuthFailed).await;
                return;
            }
            Err(_) => {
                warn!("unparseable handshake frame");
                send_disconnect(&mut ws_tx, DisconnectReason::AuthFailed).await;
                return;
            }
        },
        Ok(_) => {
            debug!("connection closed before handshake");
            return;
        }
        Err(_) => {
            warn!("handshake timed out");
            send_disconnect(&mut ws_tx, DisconnectReason::AuthFailed).await;
            return;
        }
    };

    if !gateway.auth.authenticate(&token).await {
        counter!("auth_failures_total").increment(1);
        send_disconnect(&mut ws_tx, DisconnectReason::AuthFailed).await;
        return;
    }

    let conn_id = ConnectionId::new();
    let _ = tracing::Span::current().record("conn_id", conn_id.as_str());

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(1024);
    let connection = Arc::new(ClientConnection::new(conn_id.clone(), send_tx));
    if let Err(err) = gateway.connections.add(Arc::clone(&connection)).await {
        warn!(conn_id = %conn_id, error = %err, "connection refused");
        send_disconnect(&mut ws_tx, DisconnectReason::ServerFull).await;
        return;
    }

    let connection_start = std::time::Instant::now();
    info!(conn_id = %conn_id, "client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    let ack = Event::ConnectAck(ConnectAckPayload {
        connection_id: conn_id.clone(),
    });
    if let Ok(json) = serde_json::to_string(&ack) {
        let _ = ws_tx.send(Message::Text(json.into())).await;
    }

    // Outbound forwarder with Ping frames and the heartbeat liveness check.
    let outbound_conn = Arc::clone(&connection);
    let heartbeat_timeout = gateway.heartbeat_timeout;
    let outbound_shutdown = shutdown.clone();
    let outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_heartbeat_elapsed() > PONG_TIMEOUT
                    {
                        warn!("client unresponsive for {:?}, disconnecting", PONG_TIMEOUT);
                        break;
                    }
                    if outbound_conn.last_heartbeat_elapsed() > heartbeat_timeout {
                        warn!("heartbeat window lapsed, disconnecting");
                        let frame = Event::Disconnect(DisconnectPayload {
                            reason: DisconnectReason::HeartbeatTimeout,
                        });
                        if let Ok(json) = serde_json::to_string(&frame) {
                            let _ = ws_tx.send(Message::Text(json.into())).await;
                        }
                        break;
                    }
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_shutdown.cancelled() => {
                    // Flush whatever is already queued, then close.
                    while let Ok(text) = send_rx.try_recv() {
                        if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Inbound loop.
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match frame_text(msg, &connection) {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(()) => {
                info!(conn_id = %conn_id, "client sent close frame");
                break;
            }
        };

        let event: Event = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(err) => {
                warn!(conn_id = %conn_id, error = %err, "malformed frame dropped");
                counter!("malformed_frames_total").increment(1);
                continue;
            }
        };

        if gateway.handle_event(&conn_id, event).await != SessionControl::Continue {
            break;
        }
    }

    info!(conn_id = %conn_id, "client disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection_start.elapsed().as_secs_f64());
    outbound.abort();
    gateway.on_disconnect(&conn_id).await;
}

async fn send_disconnect(
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
    reason: DisconnectReason,
) {
    let frame = Event::Disconnect(DisconnectPayload { reason });
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = ws_tx.send(Message::Text(json.into())).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}
