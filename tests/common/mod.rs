#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary exercises every helper"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Mock status feed server.
///
/// Captures every client request on a channel and broadcasts injected
/// messages to all connected clients. Sessions can be dropped (to provoke
/// reconnects) and the listener itself can be shut down (to make reconnect
/// attempts fail).
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Receives requests sent by clients
    request_rx: mpsc::UnboundedReceiver<String>,
    disconnect_signal: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl MockWsServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (request_tx, request_rx) = mpsc::unbounded_channel::<String>();
        let disconnect_signal = Arc::new(AtomicBool::new(false));

        let broadcast_tx = message_tx.clone();
        let disconnect = Arc::clone(&disconnect_signal);

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let requests = request_tx.clone();
                let mut messages = broadcast_tx.subscribe();
                let disconnect = Arc::clone(&disconnect);

                tokio::spawn(async move {
                    loop {
                        if disconnect.load(Ordering::SeqCst) {
                            break;
                        }

                        tokio::select! {
                            request = read.next() => {
                                match request {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(requests.send(text.to_string()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            message = messages.recv() => {
                                match message {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            () = tokio::time::sleep(Duration::from_millis(20)) => {}
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            request_rx,
            disconnect_signal,
            accept_task,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    /// Send a message to all connected clients.
    pub fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    /// Receive the next client request, waiting up to two seconds.
    pub async fn recv_request(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.request_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next client request with a custom deadline.
    pub async fn recv_request_within(&mut self, deadline: Duration) -> Option<String> {
        timeout(deadline, self.request_rx.recv()).await.ok().flatten()
    }

    /// Drop every live session. New connections are still accepted until
    /// [`shutdown`](Self::shutdown).
    pub fn disconnect_all(&self) {
        self.disconnect_signal.store(true, Ordering::SeqCst);
    }

    /// Accept sessions normally again after [`disconnect_all`](Self::disconnect_all).
    pub fn allow_connections(&self) {
        self.disconnect_signal.store(false, Ordering::SeqCst);
    }

    /// Stop listening entirely and drop every live session, so reconnect
    /// attempts fail at the transport level.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.disconnect_signal.store(true, Ordering::SeqCst);
    }
}

/// Endpoint that refuses connections: the port was bound once and released.
pub async fn unreachable_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/stream")
}

/// Example payloads in the feed's documented shapes.
pub mod payloads {
    use serde_json::{Value, json};

    #[must_use]
    pub fn connected(version: &str) -> Value {
        json!({
            "type": "connected",
            "message": "welcome",
            "version": version,
            "timestamp": 1_700_000_000_000_i64
        })
    }

    #[must_use]
    pub fn equipment_status(equipment_id: u64, status: &str) -> Value {
        json!({
            "type": "equipment_status",
            "equipment_id": equipment_id,
            "status": status,
            "load_pct": 42
        })
    }

    #[must_use]
    pub fn subscribed(equipment_ids: &[u64]) -> Value {
        json!({
            "type": "subscribed",
            "equipment_ids": equipment_ids,
            "message": "ok",
            "timestamp": 1_700_000_000_000_i64
        })
    }

    #[must_use]
    pub fn pong() -> Value {
        json!({ "type": "pong", "timestamp": 1_700_000_000_000_i64 })
    }

    #[must_use]
    pub fn server_error(message: &str) -> Value {
        json!({ "type": "error", "message": message, "timestamp": 1_700_000_000_000_i64 })
    }
}
