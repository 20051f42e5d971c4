//! Reconnect and buffering behavior driven through a scripted dialer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use hail_client::config::ClientConfig;
use hail_client::connection::{ConnectionManager, ConnectionState};
use hail_client::transport::{Channel, Dialer, TransportError};
use hail_core::ids::{ConnectionId, RiderId};
use hail_core::protocol::{Event, HeartbeatPayload, RideRequestPayload};

/// Server side of one scripted connection.
struct ServerEnd {
    /// Events the client sent on this connection.
    received: Arc<Mutex<Vec<Event>>>,
    /// Inject an event toward the client.
    to_client: mpsc::Sender<Event>,
    /// Drops both channel ends, severing the connection.
    kill: tokio_util::sync::CancellationToken,
}

impl ServerEnd {
    fn sever(&self) {
        self.kill.cancel();
    }
}

enum Script {
    /// Fail the dial with a retryable error.
    Refuse,
    /// Accept and auto-ack heartbeats.
    Accept,
}

/// Dialer that plays back a script, then refuses further dials.
struct ScriptedDialer {
    script: Mutex<VecDeque<Script>>,
    dials: AtomicUsize,
    servers: Mutex<Vec<Arc<ServerEnd>>>,
}

impl ScriptedDialer {
    fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            dials: AtomicUsize::new(0),
            servers: Mutex::new(Vec::new()),
        })
    }

    fn server(&self, index: usize) -> Arc<ServerEnd> {
        Arc::clone(&self.servers.lock()[index])
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self) -> Result<Channel, TransportError> {
        let n = self.dials.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();
        match step {
            Some(Script::Accept) => {
                let (client_tx, mut from_client) = mpsc::channel::<Event>(64);
                let (to_client, client_rx) = mpsc::channel::<Event>(64);
                let received = Arc::new(Mutex::new(Vec::new()));
                let kill = tokio_util::sync::CancellationToken::new();
                let end = Arc::new(ServerEnd {
                    received: Arc::clone(&received),
                    to_client: to_client.clone(),
                    kill: kill.clone(),
                });
                self.servers.lock().push(Arc::clone(&end));

                // Echo task: record events, ack heartbeats. Dropping both
                // channel ends on kill severs the connection.
                let _ = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            event = from_client.recv() => {
                                let Some(event) = event else { break };
                                if let Event::Heartbeat(HeartbeatPayload { seq }) = event {
                                    let _ = to_client
                                        .send(Event::HeartbeatAck(HeartbeatPayload { seq }))
                                        .await;
                                } else {
                                    received.lock().push(event);
                                }
                            }
                            () = kill.cancelled() => break,
                        }
                    }
                });

                Ok(Channel {
                    connection_id: ConnectionId::from(format!("conn-{n}").as_str()),
                    tx: client_tx,
                    rx: client_rx,
                })
            }
            Some(Script::Refuse) | None => Err(TransportError::Closed),
        }
    }
}

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("ws://test/ws", "tok");
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 100;
    config.reconnect.max_attempts = 5;
    config.heartbeat_interval_ms = 1000;
    config.heartbeat_timeout_ms = 3000;
    config
}

fn ride_request(n: u32) -> Event {
    Event::RideRequest(RideRequestPayload {
        origin: format!("origin-{n}"),
        destination: "dest".into(),
        rider_id: RiderId::from("rider-1"),
    })
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: &ConnectionState) {
    loop {
        if &*rx.borrow() == want {
            return;
        }
        rx.changed().await.expect("state sender dropped");
    }
}

#[tokio::test(start_paused = true)]
async fn connects_and_reaches_connected_state() {
    let dialer = ScriptedDialer::new(vec![Script::Accept]);
    let (manager, _inbound) =
        ConnectionManager::new(test_config(), Arc::clone(&dialer) as Arc<dyn Dialer>);

    manager.connect();
    let mut state = manager.state();
    wait_for_state(&mut state, &ConnectionState::Connected).await;
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_until_a_dial_succeeds() {
    let dialer = ScriptedDialer::new(vec![Script::Refuse, Script::Refuse, Script::Accept]);
    let (manager, _inbound) =
        ConnectionManager::new(test_config(), Arc::clone(&dialer) as Arc<dyn Dialer>);

    manager.connect();
    let mut state = manager.state();
    wait_for_state(&mut state, &ConnectionState::Connected).await;
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_flow_and_keep_the_session_alive() {
    let dialer = ScriptedDialer::new(vec![Script::Accept]);
    let (manager, _inbound) =
        ConnectionManager::new(test_config(), Arc::clone(&dialer) as Arc<dyn Dialer>);

    manager.connect();
    let mut state = manager.state();
    wait_for_state(&mut state, &ConnectionState::Connected).await;

    // Several heartbeat intervals pass; acks keep the session Connected.
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    assert_eq!(manager.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn buffered_events_flush_in_order_on_connect() {
    // First dial refused: the two sends below must survive the outage.
    let dialer = ScriptedDialer::new(vec![Script::Refuse, Script::Accept]);
    let (manager, _inbound) =
        ConnectionManager::new(test_config(), Arc::clone(&dialer) as Arc<dyn Dialer>);

    assert!(!manager.send(ride_request(1)));
    assert!(!manager.send(ride_request(2)));
    assert_eq!(manager.buffered_len(), 2);

    manager.connect();
    let mut state = manager.state();
    wait_for_state(&mut state, &ConnectionState::Connected).await;

    // Buffered events arrived on the connection, oldest first.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let server = dialer.server(0);
    let received = server.received.lock().clone();
    let origins: Vec<String> = received
        .iter()
        .filter_map(|e| match e {
            Event::RideRequest(p) => Some(p.origin.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(origins, vec!["origin-1", "origin-2"]);
    assert_eq!(manager.buffered_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn severed_connection_reconnects_and_delivers_later_sends() {
    let dialer = ScriptedDialer::new(vec![Script::Accept, Script::Accept]);
    let (manager, _inbound) =
        ConnectionManager::new(test_config(), Arc::clone(&dialer) as Arc<dyn Dialer>);

    manager.connect();
    let mut state = manager.state();
    wait_for_state(&mut state, &ConnectionState::Connected).await;

    // Kill the first connection. Dropping every inject sender closes the
    // client's inbound receiver, which the session treats as lost.
    {
        let first = dialer.servers.lock().remove(0);
        first.sever();
    }

    // Wait out the backoff; the loop redials on its own.
    loop {
        if dialer.dials.load(Ordering::SeqCst) >= 2
            && manager.current_state() == ConnectionState::Connected
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // A send after recovery lands on the new connection; nothing was lost
    // to the dead one.
    assert!(manager.send(ride_request(7)));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let second = dialer.server(0);
    let received = second.received.lock().clone();
    match received.as_slice() {
        [Event::RideRequest(p)] => assert_eq!(p.origin, "origin-7"),
        other => panic!("unexpected events: {other:?}"),
    }
    assert_eq!(manager.buffered_drop_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_the_loop() {
    let dialer = ScriptedDialer::new(vec![Script::Accept, Script::Accept]);
    let (manager, _inbound) =
        ConnectionManager::new(test_config(), Arc::clone(&dialer) as Arc<dyn Dialer>);

    manager.connect();
    let mut state = manager.state();
    wait_for_state(&mut state, &ConnectionState::Connected).await;

    manager.disconnect();
    wait_for_state(&mut state, &ConnectionState::Disconnected).await;
    // No further dials after an explicit disconnect.
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn server_events_reach_the_subscriber() {
    let dialer = ScriptedDialer::new(vec![Script::Accept]);
    let (manager, mut inbound) =
        ConnectionManager::new(test_config(), Arc::clone(&dialer) as Arc<dyn Dialer>);

    manager.connect();
    let mut state = manager.state();
    wait_for_state(&mut state, &ConnectionState::Connected).await;

    let server = dialer.server(0);
    server
        .to_client
        .send(Event::RideNoDrivers(hail_core::protocol::RideNoDriversPayload {
            ride_id: hail_core::ids::RideId::from("ride-1"),
        }))
        .await
        .unwrap();

    let event = inbound.recv().await.unwrap();
    match event {
        Event::RideNoDrivers(p) => assert_eq!(p.ride_id, hail_core::ids::RideId::from("ride-1")),
        other => panic!("unexpected event: {other:?}"),
    }
}
