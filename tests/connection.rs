#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt as _;
use livestatus_client::protocol::response::StatusUpdate;
use livestatus_client::services::{IdentifierMap, PassthroughIdentifiers};
use livestatus_client::ws::config::Config;
use livestatus_client::ws::connection::{ConnectionManager, ConnectionState};
use livestatus_client::ws::traits::{ConnectionObserver, NoopObserver};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::common::{MockWsServer, payloads, unreachable_endpoint};

/// Observer recording every callback for assertions.
#[derive(Default)]
struct Recorder {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    reconnecting: Mutex<Vec<(u32, u32)>>,
    errors: Mutex<Vec<String>>,
    updates: Mutex<Vec<(u64, String)>>,
}

impl ConnectionObserver for Recorder {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reconnecting(&self, attempt: u32, max_attempts: u32) {
        self.reconnecting.lock().unwrap().push((attempt, max_attempts));
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_owned());
    }

    fn on_status_update(&self, equipment_id: u64, update: &StatusUpdate) {
        self.updates
            .lock()
            .unwrap()
            .push((equipment_id, update.status.clone()));
    }
}

/// Translator shifting external ids by 1000 and dropping id 99.
struct OffsetTranslator;

impl IdentifierMap for OffsetTranslator {
    fn translate(&self, external: u64) -> Option<u64> {
        (external != 99).then_some(external + 1000)
    }
}

fn quiet_config() -> Config {
    let mut config = Config::default();
    // No probes: request capture in these tests must only see commands.
    config.heartbeat_interval = Duration::ZERO;
    config.reconnect.max_attempts = 5;
    config.reconnect.delay = Duration::from_millis(50);
    config
}

fn manager(endpoint: &str, config: Config, observer: Arc<Recorder>) -> ConnectionManager {
    ConnectionManager::new(
        endpoint,
        config,
        Arc::new(PassthroughIdentifiers),
        observer,
    )
    .unwrap()
}

async fn wait_for_state<F: Fn(ConnectionState) -> bool>(
    mut rx: watch::Receiver<ConnectionState>,
    deadline: Duration,
    predicate: F,
) -> bool {
    timeout(deadline, async {
        loop {
            if predicate(*rx.borrow()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok()
        && predicate(*rx.borrow())
}

mod connect {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_scheme() {
        let result = ConnectionManager::new(
            "http://localhost/stream",
            Config::default(),
            Arc::new(PassthroughIdentifiers),
            Arc::new(NoopObserver),
        );

        assert!(result.is_err(), "http endpoint should be rejected");
    }

    #[tokio::test]
    async fn connect_transitions_and_notifies() {
        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = manager(&server.ws_url(), quiet_config(), Arc::clone(&recorder));

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.connect().await.unwrap());
        assert!(connection.state().is_connected());
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_when_already_connected_is_a_noop() {
        let mut server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = manager(&server.ws_url(), quiet_config(), Arc::clone(&recorder));

        assert!(connection.connect().await.unwrap());
        assert!(connection.connect().await.unwrap());

        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
        // No duplicate session means no stray requests either.
        assert!(
            server
                .recv_request_within(Duration::from_millis(200))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn connect_while_connecting_returns_false() {
        // A listener that accepts TCP but never answers the WebSocket
        // handshake keeps connect() suspended in Connecting.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/stream", listener.local_addr().unwrap());
        let hold = tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                sockets.push(socket);
            }
        });

        let connection = manager(&endpoint, quiet_config(), Arc::new(Recorder::default()));
        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.connect().await })
        };

        sleep(Duration::from_millis(100)).await;
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(
            !connection.connect().await.unwrap(),
            "connect during Connecting must report false without transition"
        );

        pending.abort();
        hold.abort();
    }

    #[tokio::test]
    async fn connect_failure_leaves_disconnected_and_errors() {
        let endpoint = unreachable_endpoint().await;
        let recorder = Arc::new(Recorder::default());
        let connection = manager(&endpoint, quiet_config(), Arc::clone(&recorder));

        assert!(connection.connect().await.is_err());
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // A failed explicit connect must not start the reconnect sequence.
        sleep(Duration::from_millis(200)).await;
        assert!(recorder.reconnecting.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn captures_server_version_from_handshake_ack() {
        let server = MockWsServer::start().await;
        let connection = manager(
            &server.ws_url(),
            quiet_config(),
            Arc::new(Recorder::default()),
        );
        connection.connect().await.unwrap();
        assert!(connection.server_version().is_none());

        server.send(&payloads::connected("2.4.1").to_string());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(connection.server_version().as_deref(), Some("2.4.1"));
    }
}

mod subscriptions {
    use super::*;

    #[tokio::test]
    async fn offline_subscribe_is_flushed_once_on_connect() {
        let mut server = MockWsServer::start().await;
        let connection = manager(
            &server.ws_url(),
            quiet_config(),
            Arc::new(Recorder::default()),
        );

        // Mutations while disconnected are retained, not sent.
        connection.subscribe(&[20, 10]).unwrap();
        assert_eq!(connection.subscriptions(), vec![10, 20]);

        connection.connect().await.unwrap();

        let flush = server.recv_request().await.unwrap();
        assert_eq!(flush, r#"{"action":"subscribe","equipment_ids":[10,20]}"#);
        assert!(
            server
                .recv_request_within(Duration::from_millis(300))
                .await
                .is_none(),
            "exactly one subscribe command must be sent"
        );
    }

    #[tokio::test]
    async fn connected_subscribe_sends_only_new_ids() {
        let mut server = MockWsServer::start().await;
        let connection = manager(
            &server.ws_url(),
            quiet_config(),
            Arc::new(Recorder::default()),
        );
        connection.connect().await.unwrap();

        connection.subscribe(&[10]).unwrap();
        let first = server.recv_request().await.unwrap();
        assert!(first.contains("[10]"));

        // Already tracked: no duplicate command.
        connection.subscribe(&[10]).unwrap();
        assert!(
            server
                .recv_request_within(Duration::from_millis(200))
                .await
                .is_none()
        );

        // Mixed: only the new identifier goes on the wire.
        connection.subscribe(&[10, 20]).unwrap();
        let second = server.recv_request().await.unwrap();
        assert_eq!(second, r#"{"action":"subscribe","equipment_ids":[20]}"#);
    }

    #[tokio::test]
    async fn unsubscribe_sends_only_tracked_ids() {
        let mut server = MockWsServer::start().await;
        let connection = manager(
            &server.ws_url(),
            quiet_config(),
            Arc::new(Recorder::default()),
        );
        connection.connect().await.unwrap();

        connection.subscribe(&[10, 20]).unwrap();
        let _subscribe = server.recv_request().await.unwrap();

        connection.unsubscribe(&[20, 30]).unwrap();
        let unsubscribe = server.recv_request().await.unwrap();
        assert_eq!(unsubscribe, r#"{"action":"unsubscribe","equipment_ids":[20]}"#);
        assert_eq!(connection.subscriptions(), vec![10]);
    }

    #[tokio::test]
    async fn subscribe_equipment_is_single_id_convenience() {
        let mut server = MockWsServer::start().await;
        let connection = manager(
            &server.ws_url(),
            quiet_config(),
            Arc::new(Recorder::default()),
        );
        connection.connect().await.unwrap();

        connection.subscribe_equipment(7).unwrap();

        let request = server.recv_request().await.unwrap();
        assert_eq!(request, r#"{"action":"subscribe","equipment_ids":[7]}"#);
    }

    #[tokio::test]
    async fn request_status_requires_connection() {
        let server = MockWsServer::start().await;
        let connection = manager(
            &server.ws_url(),
            quiet_config(),
            Arc::new(Recorder::default()),
        );

        assert!(connection.request_status(&[1]).is_err());
    }

    #[tokio::test]
    async fn resubscribes_full_set_after_reconnect() {
        let mut server = MockWsServer::start().await;
        let connection = manager(
            &server.ws_url(),
            quiet_config(),
            Arc::new(Recorder::default()),
        );
        connection.connect().await.unwrap();

        connection.subscribe(&[10]).unwrap();
        let _first = server.recv_request().await.unwrap();
        connection.subscribe(&[20]).unwrap();
        let _second = server.recv_request().await.unwrap();

        // Kill every live session, then accept again.
        server.disconnect_all();
        sleep(Duration::from_millis(100)).await;
        server.allow_connections();

        let replay = server.recv_request().await.unwrap();
        assert_eq!(
            replay,
            r#"{"action":"subscribe","equipment_ids":[10,20]}"#,
            "the full set must be replayed in one command"
        );
        assert!(
            server
                .recv_request_within(Duration::from_millis(300))
                .await
                .is_none(),
            "no duplicate subscribe commands after the replay"
        );
    }
}

mod reconnection {
    use super::*;

    #[tokio::test]
    async fn bounded_attempts_end_in_closed() {
        let mut config = quiet_config();
        config.reconnect.max_attempts = 2;
        config.reconnect.delay = Duration::ZERO;

        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = manager(&server.ws_url(), config, Arc::clone(&recorder));
        connection.connect().await.unwrap();

        let state_rx = connection.state_receiver();
        server.shutdown();

        assert!(
            wait_for_state(state_rx, Duration::from_secs(2), |state| {
                state == ConnectionState::Closed
            })
            .await,
            "exhausted reconnects must end in Closed"
        );
        assert_eq!(
            recorder.reconnecting.lock().unwrap().clone(),
            vec![(1, 2), (2, 2)],
            "on_reconnecting must fire exactly twice with (attempt, max)"
        );

        // Terminal: no further timer may be scheduled.
        sleep(Duration::from_millis(200)).await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(recorder.reconnecting.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn successful_reconnect_resets_attempt_counter() {
        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = manager(&server.ws_url(), quiet_config(), Arc::clone(&recorder));
        connection.connect().await.unwrap();

        server.disconnect_all();
        sleep(Duration::from_millis(100)).await;
        server.allow_connections();

        let state_rx = connection.state_receiver();
        assert!(
            wait_for_state(state_rx, Duration::from_secs(2), |state| {
                state.is_connected()
            })
            .await
        );
        assert!(recorder.connected.load(Ordering::SeqCst) >= 2);
        assert!(recorder.disconnected.load(Ordering::SeqCst) >= 1);

        // A later disconnect starts counting from one again.
        server.disconnect_all();
        sleep(Duration::from_millis(100)).await;
        server.allow_connections();

        let state_rx = connection.state_receiver();
        assert!(
            wait_for_state(state_rx, Duration::from_secs(2), |state| {
                state.is_connected()
            })
            .await
        );
        let attempts = recorder.reconnecting.lock().unwrap().clone();
        assert!(
            attempts.iter().all(|(attempt, _)| *attempt == 1),
            "attempt counter must reset after every successful connect, got {attempts:?}"
        );
    }

    #[tokio::test]
    async fn explicit_disconnect_is_terminal() {
        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = manager(&server.ws_url(), quiet_config(), Arc::clone(&recorder));
        connection.connect().await.unwrap();
        connection.subscribe(&[10]).unwrap();

        connection.disconnect().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(300)).await;
        assert!(
            recorder.reconnecting.lock().unwrap().is_empty(),
            "an explicit disconnect must never auto-reconnect"
        );
        // The set survives for a later reconnect; only the resend flag is cleared.
        assert_eq!(connection.subscriptions(), vec![10]);
    }
}

mod dispatch {
    use super::*;

    fn translated_manager(server: &MockWsServer, recorder: Arc<Recorder>) -> ConnectionManager {
        ConnectionManager::new(
            &server.ws_url(),
            quiet_config(),
            Arc::new(OffsetTranslator),
            recorder,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn status_updates_are_translated() {
        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = translated_manager(&server, Arc::clone(&recorder));
        connection.connect().await.unwrap();

        server.send(&payloads::equipment_status(5, "running").to_string());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            recorder.updates.lock().unwrap().clone(),
            vec![(1005, "running".to_owned())]
        );
    }

    #[tokio::test]
    async fn unmapped_equipment_is_dropped_silently() {
        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = translated_manager(&server, Arc::clone(&recorder));
        connection.connect().await.unwrap();

        server.send(&payloads::equipment_status(99, "running").to_string());
        server.send(&payloads::equipment_status(5, "idle").to_string());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            recorder.updates.lock().unwrap().clone(),
            vec![(1005, "idle".to_owned())]
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_do_not_break_the_loop() {
        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = translated_manager(&server, Arc::clone(&recorder));
        connection.connect().await.unwrap();

        server.send("{not json");
        server.send(&serde_json::json!({ "type": "maintenance_window" }).to_string());
        server.send(&payloads::equipment_status(5, "running").to_string());
        sleep(Duration::from_millis(100)).await;

        assert!(connection.state().is_connected());
        assert_eq!(recorder.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn server_errors_reach_the_observer() {
        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = translated_manager(&server, Arc::clone(&recorder));
        connection.connect().await.unwrap();

        server.send(&payloads::server_error("subscription limit reached").to_string());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            recorder.errors.lock().unwrap().clone(),
            vec!["subscription limit reached".to_owned()]
        );
        assert!(connection.state().is_connected());
    }

    #[tokio::test]
    async fn status_update_stream_yields_translated_tuples() {
        let server = MockWsServer::start().await;
        let connection = translated_manager(&server, Arc::new(Recorder::default()));
        connection.connect().await.unwrap();

        let stream = connection.status_updates();
        let mut stream = Box::pin(stream);

        server.send(&payloads::equipment_status(7, "fault").to_string());

        let (equipment_id, update) = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(equipment_id, 1007);
        assert_eq!(update.status, "fault");
    }
}

mod heartbeat {
    use super::*;

    #[tokio::test]
    async fn probes_are_sent_and_acks_recorded() {
        let mut config = quiet_config();
        config.heartbeat_interval = Duration::from_millis(50);

        let mut server = MockWsServer::start().await;
        let connection = manager(&server.ws_url(), config, Arc::new(Recorder::default()));
        connection.connect().await.unwrap();
        assert!(connection.last_heartbeat_ack().is_none());

        let probe = server.recv_request().await.unwrap();
        assert_eq!(probe, r#"{"action":"ping"}"#);

        server.send(&payloads::pong().to_string());
        sleep(Duration::from_millis(100)).await;

        assert!(connection.last_heartbeat_ack().is_some());
    }

    #[tokio::test]
    async fn missed_ack_without_deadline_is_tolerated() {
        let mut config = quiet_config();
        config.heartbeat_interval = Duration::from_millis(50);
        // heartbeat_timeout stays None: observe-only.

        let server = MockWsServer::start().await;
        let connection = manager(&server.ws_url(), config, Arc::new(Recorder::default()));
        connection.connect().await.unwrap();

        sleep(Duration::from_millis(300)).await;
        assert!(
            connection.state().is_connected(),
            "without a deadline, silence must not tear the session down"
        );
    }

    #[tokio::test]
    async fn missed_ack_with_deadline_ends_the_session() {
        let mut config = quiet_config();
        config.heartbeat_interval = Duration::from_millis(50);
        config.heartbeat_timeout = Some(Duration::from_millis(100));
        config.auto_reconnect = false;

        let server = MockWsServer::start().await;
        let recorder = Arc::new(Recorder::default());
        let connection = manager(&server.ws_url(), config, Arc::clone(&recorder));
        connection.connect().await.unwrap();

        let state_rx = connection.state_receiver();
        assert!(
            wait_for_state(state_rx, Duration::from_secs(2), |state| {
                state == ConnectionState::Disconnected
            })
            .await,
            "an enforced deadline must end the session when no pong arrives"
        );
        assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);
    }
}
