#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Each integration test binary uses a different subset of these helpers"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_realtime_client::ws::{ReconnectConfig, Status};
use analysis_realtime_client::{Session, SessionProvider, StaticSession};
use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const SESSION_ID: &str = "abc-123";
pub const USER_ID: &str = "user-7";

/// How long a test waits for something that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

#[must_use]
pub fn sessions() -> Arc<dyn SessionProvider> {
    Arc::new(StaticSession::new(
        Session::new(SESSION_ID).with_user_id(USER_ID),
    ))
}

#[must_use]
pub fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectConfig {
    ReconnectConfig::new(vec![Duration::from_millis(20)], max_attempts)
}

/// Sessions that can be expired; `refresh` switches to the next session id.
pub struct ExpiringSessions {
    current: Mutex<String>,
    renewed: Mutex<String>,
    valid: AtomicBool,
    refreshes: AtomicUsize,
}

impl ExpiringSessions {
    #[must_use]
    pub fn new(session_id: &str) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(session_id.to_owned()),
            renewed: Mutex::new(session_id.to_owned()),
            valid: AtomicBool::new(true),
            refreshes: AtomicUsize::new(0),
        })
    }

    /// Invalidate the current session; the next refresh returns `renewed_id`.
    pub fn expire(&self, renewed_id: &str) {
        renewed_id.clone_into(&mut self.renewed.lock().unwrap());
        self.valid.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for ExpiringSessions {
    async fn session(&self) -> analysis_realtime_client::Result<Session> {
        Ok(Session::new(self.current.lock().unwrap().clone()))
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn refresh(&self) -> analysis_realtime_client::Result<Session> {
        let renewed = self.renewed.lock().unwrap().clone();
        renewed.clone_into(&mut self.current.lock().unwrap());
        self.valid.store(true, Ordering::SeqCst);
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Session::new(renewed))
    }
}

/// Host that accepts connections and never answers, keeping them open.
pub async fn unresponsive_host() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    format!("http://{addr}")
}

/// Wait until the client's status satisfies `predicate`.
pub async fn wait_for<F>(status: &mut watch::Receiver<Status>, predicate: F) -> Status
where
    F: FnMut(&Status) -> bool,
{
    *timeout(WAIT, status.wait_for(predicate))
        .await
        .expect("timed out waiting for status")
        .unwrap()
}

/// Behaviour knobs for [`MockWsServer`].
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Reply `pong` to the client's `ping`
    pub answer_pings: bool,
    /// Reply `ack` to every frame carrying a `messageId`
    pub acknowledge: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            answer_pings: true,
            acknowledge: false,
        }
    }
}

/// Mock real-time server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Frames pushed to every connected client
    message_tx: broadcast::Sender<String>,
    /// Close codes pushed to every connected client
    close_tx: broadcast::Sender<u16>,
    /// Application frames received from clients; pings are counted, not forwarded
    received_rx: mpsc::UnboundedReceiver<Value>,
    /// Close codes received from clients
    client_close_rx: mpsc::UnboundedReceiver<Option<u16>>,
    paths: Arc<Mutex<Vec<String>>>,
    /// Completed WebSocket handshakes
    connections: Arc<AtomicUsize>,
    /// Every TCP connection, including plain HTTP requests and refused handshakes
    accepted: Arc<AtomicUsize>,
    /// Handshakes are refused with `503` while unset
    upgrading: Arc<AtomicBool>,
    pings: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock server on a random port.
    pub async fn start(options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (close_tx, _) = broadcast::channel::<u16>(8);
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (client_close_tx, client_close_rx) = mpsc::unbounded_channel();
        let paths = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let upgrading = Arc::new(AtomicBool::new(true));
        let pings = Arc::new(AtomicUsize::new(0));

        let server = Self {
            addr,
            message_tx: message_tx.clone(),
            close_tx: close_tx.clone(),
            received_rx,
            client_close_rx,
            paths: Arc::clone(&paths),
            connections: Arc::clone(&connections),
            accepted: Arc::clone(&accepted),
            upgrading: Arc::clone(&upgrading),
            pings: Arc::clone(&pings),
        };

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let record_path = Arc::clone(&paths);
                let upgrade = upgrading.load(Ordering::SeqCst);
                let callback = move |request: &Request, response: Response| {
                    if !upgrade {
                        let mut refusal = ErrorResponse::new(Some("unavailable".to_owned()));
                        *refusal.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                        return Err(refusal);
                    }
                    record_path
                        .lock()
                        .unwrap()
                        .push(request.uri().path().to_owned());
                    Ok::<Response, ErrorResponse>(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };
                connections.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let mut msg_rx = message_tx.subscribe();
                let mut close_rx = close_tx.subscribe();
                let received_tx = received_tx.clone();
                let client_close_tx = client_close_tx.clone();
                let pings = Arc::clone(&pings);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                let text = match msg {
                                    Some(Ok(Message::Text(text))) => text,
                                    Some(Ok(Message::Close(frame))) => {
                                        drop(client_close_tx.send(frame.map(|f| u16::from(f.code))));
                                        break;
                                    }
                                    Some(Ok(_)) => continue,
                                    _ => break,
                                };
                                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                                    continue;
                                };

                                if frame["type"] == "ping" {
                                    pings.fetch_add(1, Ordering::SeqCst);
                                    if options.answer_pings {
                                        let pong = json!({ "type": "pong" }).to_string();
                                        if write.send(Message::Text(pong.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    continue;
                                }

                                if options.acknowledge
                                    && let Some(id) = frame.get("messageId").and_then(Value::as_u64)
                                {
                                    let ack = json!({ "type": "ack", "messageId": id }).to_string();
                                    if write.send(Message::Text(ack.into())).await.is_err() {
                                        break;
                                    }
                                }
                                drop(received_tx.send(frame));
                            }
                            msg = msg_rx.recv() => {
                                let Ok(text) = msg else { break };
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            code = close_rx.recv() => {
                                let Ok(code) = code else { break };
                                let frame = CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: Utf8Bytes::from_static("server close"),
                                };
                                drop(write.send(Message::Close(Some(frame))).await);
                                break;
                            }
                        }
                    }
                });
            }
        });

        server
    }

    /// Base URL to hand to the client as its host.
    #[must_use]
    pub fn host(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Send a raw frame to all connected clients.
    pub fn send(&self, frame: &str) {
        drop(self.message_tx.send(frame.to_owned()));
    }

    pub fn send_json(&self, frame: &Value) {
        self.send(&frame.to_string());
    }

    /// Close every open connection with `code`.
    pub fn close_all(&self, code: u16) {
        drop(self.close_tx.send(code));
    }

    /// Next application frame sent by a client.
    pub async fn recv(&mut self) -> Option<Value> {
        timeout(WAIT, self.received_rx.recv()).await.ok().flatten()
    }

    /// Application frames already received, without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.received_rx.try_recv().ok()
    }

    /// Next close code sent by a client.
    pub async fn recv_close(&mut self) -> Option<Option<u16>> {
        timeout(WAIT, self.client_close_rx.recv()).await.ok().flatten()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Accept or refuse subsequent handshakes.
    pub fn set_upgrading(&self, upgrading: bool) {
        self.upgrading.store(upgrading, Ordering::SeqCst);
    }

    #[must_use]
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    /// Wait until at least `count` handshakes have completed.
    pub async fn wait_for_connections(&self, count: usize) {
        timeout(WAIT, async {
            while self.connections() < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for connections");
    }
}
