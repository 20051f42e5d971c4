//! Connection manager: dial, heartbeat, reconnect with jittered backoff.
//!
//! One spawned task owns the whole lifecycle. State transitions are
//! published through a `watch` channel so callers can render connection
//! status without polling. Events sent while disconnected land in a
//! bounded buffer that drops its oldest entry (and counts the drop) when
//! full, then flush in order on reconnect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hail_core::backoff::delay_for_attempt_with_random;
use hail_core::protocol::{DisconnectReason, Event, HeartbeatPayload};

use crate::config::ClientConfig;
use crate::transport::{Channel, Dialer};

/// Observable connection lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none in progress.
    Disconnected,
    /// First dial in progress.
    Connecting,
    /// Live, authenticated channel.
    Connected,
    /// Connection lost; the numbered retry is pending or in progress.
    Reconnecting {
        /// 1-based reconnect attempt.
        attempt: u32,
    },
    /// Retries exhausted or the credential was rejected. `connect` must be
    /// called again to leave this state.
    Failed,
}

/// How a session ended, deciding what the loop does next.
enum SessionEnd {
    /// Channel died; reconnect.
    Lost,
    /// Server rejected us permanently.
    Fatal,
    /// `disconnect` was called.
    Cancelled,
}

/// Client connection manager. Cheap to share via `Arc`.
pub struct ConnectionManager {
    config: ClientConfig,
    dialer: Arc<dyn Dialer>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    current_tx: Mutex<Option<mpsc::Sender<Event>>>,
    buffer: Mutex<VecDeque<Event>>,
    buffered_drops: AtomicU64,
    heartbeat_seq: AtomicU64,
    inbound_tx: mpsc::Sender<Event>,
}

impl ConnectionManager {
    /// Create a manager and the inbound event stream it feeds.
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let manager = Arc::new(Self {
            config,
            dialer,
            state_tx,
            state_rx,
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            current_tx: Mutex::new(None),
            buffer: Mutex::new(VecDeque::new()),
            buffered_drops: AtomicU64::new(0),
            heartbeat_seq: AtomicU64::new(0),
            inbound_tx,
        });
        (manager, inbound_rx)
    }

    /// Watch connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Current state snapshot.
    pub fn current_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Start the connection loop. A no-op while a loop is already running,
    /// so repeated calls never stack dials.
    pub fn connect(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("connect ignored, already running");
            return;
        }
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        let manager = Arc::clone(self);
        let _ = tokio::spawn(async move {
            manager.run(token).await;
            manager.running.store(false, Ordering::SeqCst);
        });
    }

    /// Stop the loop and close any live channel.
    pub fn disconnect(&self) {
        self.cancel.lock().cancel();
    }

    /// Send an event, buffering it if no channel is live.
    ///
    /// Returns `false` when the event had to be buffered.
    pub fn send(&self, event: Event) -> bool {
        let current = self.current_tx.lock();
        if let Some(tx) = current.as_ref() {
            if tx.try_send(event.clone()).is_ok() {
                return true;
            }
        }
        drop(current);
        self.buffer_event(event);
        false
    }

    /// Events waiting for the next reconnect.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Events discarded because the outbound buffer was full.
    pub fn buffered_drop_count(&self) -> u64 {
        self.buffered_drops.load(Ordering::Relaxed)
    }

    fn buffer_event(&self, event: Event) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.config.outbound_buffer_depth {
            let _ = buffer.pop_front();
            let dropped = self.buffered_drops.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "outbound buffer full, oldest event dropped");
        }
        buffer.push_back(event);
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            // Race the dial against cancellation so `disconnect` during
            // `Connecting` never leaks into a session or a retry.
            let dialed = tokio::select! {
                result = self.dialer.dial() => result,
                () = cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            };
            match dialed {
                Ok(channel) => {
                    info!(conn_id = %channel.connection_id, "connected");
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    *self.current_tx.lock() = Some(channel.tx.clone());
                    self.flush_buffer(&channel.tx).await;

                    let end = self.run_session(channel, &cancel).await;
                    *self.current_tx.lock() = None;
                    match end {
                        SessionEnd::Lost => {}
                        SessionEnd::Fatal => {
                            warn!("server rejected the session, giving up");
                            self.set_state(ConnectionState::Failed);
                            return;
                        }
                        SessionEnd::Cancelled => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    warn!(error = %err, "dial failed permanently");
                    self.set_state(ConnectionState::Failed);
                    return;
                }
                Err(err) => {
                    debug!(error = %err, attempt, "dial failed");
                }
            }

            attempt += 1;
            if self.config.reconnect.is_exhausted(attempt) {
                warn!(attempts = attempt - 1, "reconnect attempts exhausted");
                self.set_state(ConnectionState::Failed);
                return;
            }
            let delay = delay_for_attempt_with_random(
                attempt,
                self.config.reconnect.base_delay_ms,
                self.config.reconnect.max_delay_ms,
                self.config.reconnect.jitter_factor,
                rand::random::<f64>(),
            );
            debug!(attempt, delay_ms = delay, "backing off before reconnect");
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
                () = cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Drain the disconnect buffer in FIFO order onto a fresh channel.
    async fn flush_buffer(&self, tx: &mpsc::Sender<Event>) {
        loop {
            let Some(event) = self.buffer.lock().pop_front() else {
                return;
            };
            if let Err(err) = tx.send(event).await {
                // Channel died mid-flush; keep the event for the next try.
                self.buffer.lock().push_front(err.0);
                return;
            }
        }
    }

    /// Drive one live channel until it fails, the server evicts us, or
    /// `disconnect` is called.
    async fn run_session(&self, mut channel: Channel, cancel: &CancellationToken) -> SessionEnd {
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let heartbeat_timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        let mut ticker = tokio::time::interval(heartbeat_interval);
        // First tick fires immediately; the ack window starts now.
        let mut last_ack = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if last_ack.elapsed() > heartbeat_timeout {
                        warn!("no heartbeat ack within {heartbeat_timeout:?}");
                        return SessionEnd::Lost;
                    }
                    let seq = self.heartbeat_seq.fetch_add(1, Ordering::Relaxed) + 1;
                    if channel.tx.send(Event::Heartbeat(HeartbeatPayload { seq })).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                inbound = channel.rx.recv() => {
                    let Some(event) = inbound else {
                        debug!("channel closed by transport");
                        return SessionEnd::Lost;
                    };
                    match event {
                        Event::HeartbeatAck(payload) => {
                            last_ack = Instant::now();
                            debug!(seq = payload.seq, "heartbeat acked");
                        }
                        Event::Disconnect(payload) => {
                            return match payload.reason {
                                DisconnectReason::AuthFailed => SessionEnd::Fatal,
                                reason => {
                                    info!(?reason, "server closed the connection");
                                    SessionEnd::Lost
                                }
                            };
                        }
                        event => {
                            // Application events flow to the subscriber; if
                            // it lags the event is dropped there, not here.
                            if self.inbound_tx.try_send(event).is_err() {
                                warn!("inbound subscriber lagging, event dropped");
                            }
                        }
                    }
                }
                () = cancel.cancelled() => {
                    return SessionEnd::Cancelled;
                }
            }
        }
    }
}
