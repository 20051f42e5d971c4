//! Transport seam: the [`Dialer`] trait and the WebSocket implementation.
//!
//! A successful dial yields a [`Channel`] of typed [`Event`]s; the socket
//! pump stays behind the seam so the reconnect loop (and its tests) never
//! touch a real socket.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use hail_core::ids::ConnectionId;
use hail_core::protocol::{ConnectPayload, DisconnectReason, Event};

use crate::config::ClientConfig;

/// Why a dial or an established channel failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server rejected the handshake credential. Not retryable.
    #[error("authentication rejected")]
    Auth,
    /// The dial did not complete within the connect timeout.
    #[error("connect timed out")]
    Timeout,
    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,
    /// Socket or protocol failure.
    #[error("transport failure: {0}")]
    Io(String),
}

impl TransportError {
    /// Fatal errors stop the reconnect loop instead of backing off.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth)
    }
}

/// An established, authenticated event channel.
pub struct Channel {
    /// Identity assigned by the server in `connect:ack`.
    pub connection_id: ConnectionId,
    /// Outbound events toward the server.
    pub tx: mpsc::Sender<Event>,
    /// Inbound events from the server; `None` means the channel died.
    pub rx: mpsc::Receiver<Event>,
}

/// Establishes authenticated channels.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial, authenticate, and return a live channel.
    async fn dial(&self) -> Result<Channel, TransportError>;
}

/// Classify the first server frame after `connect` was sent.
fn handshake_result(event: &Event) -> Result<ConnectionId, TransportError> {
    match event {
        Event::ConnectAck(payload) => Ok(payload.connection_id.clone()),
        Event::Disconnect(payload) if payload.reason == DisconnectReason::AuthFailed => {
            Err(TransportError::Auth)
        }
        Event::Disconnect(payload) if payload.reason == DisconnectReason::ServerFull => {
            Err(TransportError::Io("server at capacity".into()))
        }
        other => Err(TransportError::Io(format!(
            "unexpected handshake reply: {}",
            other.name()
        ))),
    }
}

/// Depth of the per-channel pump queues.
const CHANNEL_DEPTH: usize = 256;

/// Real WebSocket dialer.
pub struct WsDialer {
    url: String,
    auth_token: String,
    connect_timeout: Duration,
}

impl WsDialer {
    /// Dialer for the given endpoint and credential.
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
            connect_timeout,
        }
    }

    /// Dialer wired from a [`ClientConfig`]: endpoint, credential, and
    /// connect timeout.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.url.clone(),
            config.auth_token.clone(),
            Duration::from_millis(config.connect_timeout_ms),
        )
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Channel, TransportError> {
        let deadline = tokio::time::Instant::now() + self.connect_timeout;

        let connect = tokio::time::timeout_at(deadline, connect_async(self.url.as_str()));
        let (mut ws, _) = match connect.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(TransportError::Io(err.to_string())),
            Err(_) => return Err(TransportError::Timeout),
        };

        // Auth-first: the credential goes out before anything else.
        let connect_frame = Event::Connect(ConnectPayload {
            auth_token: self.auth_token.clone(),
        });
        let json = serde_json::to_string(&connect_frame)
            .map_err(|err| TransportError::Io(err.to_string()))?;
        ws.send(Message::Text(json.into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;

        // Wait for connect:ack (or a disconnect) within the same deadline.
        let connection_id = loop {
            let frame = match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(err))) => return Err(TransportError::Io(err.to_string())),
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => return Err(TransportError::Timeout),
            };
            match frame {
                Message::Text(text) => {
                    let event: Event = serde_json::from_str(&text)
                        .map_err(|err| TransportError::Io(err.to_string()))?;
                    break handshake_result(&event)?;
                }
                Message::Close(_) => return Err(TransportError::Closed),
                // Control frames before the ack are fine.
                _ => {}
            }
        };
        debug!(conn_id = %connection_id, "handshake accepted");

        let (out_tx, mut out_rx) = mpsc::channel::<Event>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<Event>(CHANNEL_DEPTH);

        // Single pump task owns the socket: outbound serialization, inbound
        // parsing, and Ping replies.
        let _ = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(event) = outgoing else { break };
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if ws.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    incoming = ws.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<Event>(&text) {
                                    Ok(event) => {
                                        if in_tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        warn!(error = %err, "malformed frame from server");
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if ws.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                debug!(error = %err, "socket error");
                                break;
                            }
                        }
                    }
                }
            }
            // Dropping in_tx ends the session on the manager side.
        });

        Ok(Channel {
            connection_id,
            tx: out_tx,
            rx: in_rx,
        })
    }
}
