//! Shared test doubles: a recording mail transport, a recording host
//! messenger and an in-process push hub serving the event stream.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lettre::Message;
use pushmail::config::{Config, OperatingMode, SecretString};
use pushmail::{BridgeTimings, ConnectPolicy, EmailTransport, HostMessenger, HubMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

pub const CLIENT_TOKEN: &str = "Cl1entT0ken";

/// Short timings so retry and heartbeat paths run quickly.
pub fn fast_timings() -> BridgeTimings {
    BridgeTimings {
        connect: ConnectPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_millis(20),
            attempt_timeout: Duration::from_millis(200),
        },
        heartbeat_interval: Duration::from_millis(50),
    }
}

/// A config pointing at `endpoint`, with a local relay and one recipient.
pub fn bridge_config(endpoint: &str, mode: OperatingMode) -> Config {
    let mut config = Config::default_for(mode);
    config.endpoint = endpoint.to_string();
    config.token = SecretString::new(CLIENT_TOKEN.to_string());
    config.smtp.host = "localhost".to_string();
    config.smtp.port = 1025;
    config.smtp.username = "from@example.com".to_string();
    config.smtp.from.email = None;
    config.smtp.to = vec!["to@example.com".to_string()];
    config
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Recording mail transport
// =============================================================================

/// Captured email for verification.
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Full formatted message, headers included.
    pub raw: String,
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentEmail>>,
    send_count: AtomicU32,
    fail_next_n: AtomicU32,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` sends with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next_n.store(count, Ordering::SeqCst);
    }

    pub fn send_count(&self) -> u32 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub async fn wait_for_sends(&self, count: u32) -> bool {
        eventually(Duration::from_secs(5), || self.send_count() >= count).await
    }
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send_email(&self, message: Message) -> Result<(), String> {
        self.send_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_next_n.load(Ordering::SeqCst) > 0 {
            self.fail_next_n.fetch_sub(1, Ordering::SeqCst);
            return Err("451 local error in processing".to_string());
        }

        let header = |name: &str| {
            message
                .headers()
                .get_raw(name)
                .map(|v| v.to_string())
                .unwrap_or_default()
        };
        let email = SentEmail {
            from: header("From"),
            to: header("To"),
            subject: header("Subject"),
            raw: String::from_utf8_lossy(&message.formatted()).to_string(),
        };
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

// =============================================================================
// Recording host messenger
// =============================================================================

#[derive(Default)]
pub struct RecordingMessenger {
    messages: Mutex<Vec<HubMessage>>,
}

impl RecordingMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<HubMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.title).collect()
    }

    pub async fn wait_for(&self, predicate: impl Fn(&HubMessage) -> bool) -> bool {
        eventually(Duration::from_secs(5), || {
            self.messages.lock().unwrap().iter().any(&predicate)
        })
        .await
    }
}

impl HostMessenger for RecordingMessenger {
    fn send_message(&self, message: HubMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

// =============================================================================
// In-process push hub
// =============================================================================

/// What the hub does next on the live connection.
#[derive(Debug)]
pub enum HubFrame {
    Text(String),
    Ping,
    /// Closing handshake initiated by the hub.
    Close,
    /// Drop the socket without a closing handshake.
    Drop,
}

/// A push hub serving `/stream` on a local port, one connection at a time.
pub struct FakeHub {
    pub addr: SocketAddr,
    frames: mpsc::UnboundedSender<HubFrame>,
    handshakes: Arc<AtomicU32>,
    connections: Arc<AtomicU32>,
    client_closes: Arc<AtomicU32>,
    uris: Arc<Mutex<Vec<String>>>,
}

impl FakeHub {
    pub async fn start() -> Self {
        Self::start_rejecting(0).await
    }

    /// Rejects the first `rejections` handshakes with HTTP 401.
    pub async fn start_rejecting(rejections: u32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames, mut rx) = mpsc::unbounded_channel::<HubFrame>();
        let handshakes = Arc::new(AtomicU32::new(0));
        let connections = Arc::new(AtomicU32::new(0));
        let client_closes = Arc::new(AtomicU32::new(0));
        let uris = Arc::new(Mutex::new(Vec::new()));

        let hub = Self {
            addr,
            frames,
            handshakes: handshakes.clone(),
            connections: connections.clone(),
            client_closes: client_closes.clone(),
            uris: uris.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let attempt = handshakes.fetch_add(1, Ordering::SeqCst) + 1;
                let uris = uris.clone();
                let callback = move |request: &Request, response: Response| {
                    uris.lock().unwrap().push(request.uri().to_string());
                    if attempt <= rejections {
                        let mut error = ErrorResponse::new(Some("unauthorized".to_string()));
                        *error.status_mut() = StatusCode::UNAUTHORIZED;
                        return Err(error);
                    }
                    Ok(response)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                    continue;
                };
                connections.fetch_add(1, Ordering::SeqCst);

                loop {
                    tokio::select! {
                        frame = rx.recv() => match frame {
                            Some(HubFrame::Text(text)) => {
                                if ws.send(WsMessage::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Some(HubFrame::Ping) => {
                                if ws.send(WsMessage::Ping(Vec::new())).await.is_err() {
                                    break;
                                }
                            }
                            Some(HubFrame::Close) => {
                                let _ = ws.close(None).await;
                                while let Some(Ok(_)) = ws.next().await {}
                                break;
                            }
                            Some(HubFrame::Drop) => break,
                            None => return,
                        },
                        incoming = ws.next() => match incoming {
                            Some(Ok(WsMessage::Close(_))) => {
                                client_closes.fetch_add(1, Ordering::SeqCst);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) | None => break,
                        },
                    }
                }
            }
        });

        hub
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn send(&self, frame: HubFrame) {
        self.frames.send(frame).unwrap();
    }

    pub fn send_event(&self, title: &str, message: &str) {
        let event = serde_json::json!({
            "id": 1,
            "appid": 1,
            "title": title,
            "message": message,
            "priority": 5,
            "date": "2024-05-01T10:00:00Z",
        });
        self.send(HubFrame::Text(event.to_string()));
    }

    pub fn handshakes(&self) -> u32 {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn client_closes(&self) -> u32 {
        self.client_closes.load(Ordering::SeqCst)
    }

    pub fn uris(&self) -> Vec<String> {
        self.uris.lock().unwrap().clone()
    }

    pub async fn wait_connected(&self, count: u32) -> bool {
        eventually(Duration::from_secs(5), || self.connections() >= count).await
    }

    pub async fn wait_client_close(&self) -> bool {
        eventually(Duration::from_secs(5), || self.client_closes() >= 1).await
    }
}

/// Accepts TCP connections and holds them without ever answering, so the
/// WebSocket handshake never completes. Returns the endpoint and the count
/// of accepted connections.
pub async fn silent_listener() -> (String, Arc<AtomicU32>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(tcp);
        }
    });

    (format!("ws://{}", addr), accepted)
}

/// Completes the handshake, then neither reads nor writes on the socket.
pub async fn mute_hub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                held.push(ws);
            }
        }
    });

    format!("ws://{}", addr)
}

/// An address nothing listens on.
pub fn unreachable_endpoint() -> String {
    let port = portpicker::pick_unused_port().expect("No free port");
    format!("ws://127.0.0.1:{}", port)
}
