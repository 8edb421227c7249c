//! Push hub event-stream subscription.
//!
//! Opens the `<endpoint>/stream` WebSocket with a bounded, fixed-delay retry
//! policy and decodes one JSON notification per text frame.
//!
//! # Example
//!
//! ```no_run
//! use pushmail::stream::{connect, ConnectPolicy, Frame};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut stream = connect("ws://localhost", "Cl1entT0ken", &ConnectPolicy::default()).await?;
//! while let Frame::Event(event) = stream.read_event().await? {
//!     println!("{}: {}", event.title, event.message);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, ReadError};

/// Delay between two dial attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Dial attempts before the hub is declared unreachable.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Upper bound on one dial, TCP connect and WebSocket handshake included.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the closing handshake, acknowledgement included.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Path of the subscription endpoint, relative to the hub endpoint.
pub const STREAM_PATH: &str = "/stream";

/// Bounded retry policy for [`connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// A dial still pending after this long counts as one failed attempt.
    pub attempt_timeout: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// One notification as published by the hub.
///
/// Only `title` and `message` are used by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub appid: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub extras: Option<serde_json::Value>,
}

/// Result of reading one frame from the subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(NotificationEvent),
    /// The hub closed the stream. Not an error.
    Closed,
}

/// Builds the subscription URL for a normalized endpoint.
pub fn subscription_url(endpoint: &str, token: &str) -> String {
    format!(
        "{}{}?token={}",
        endpoint,
        STREAM_PATH,
        urlencoding::encode(token)
    )
}

/// Opens the subscription, retrying failed dials per `policy`.
///
/// # Errors
///
/// - `ConnectError::InvalidUrl` if the URL cannot form a WebSocket request
///   (not retried).
/// - `ConnectError::Unreachable` once `policy.max_attempts` dials failed.
pub async fn connect(
    endpoint: &str,
    token: &str,
    policy: &ConnectPolicy,
) -> Result<EventStream, ConnectError> {
    let url = subscription_url(endpoint, token);
    url.as_str()
        .into_client_request()
        .map_err(|e| ConnectError::InvalidUrl(format!("{}{}: {}", endpoint, STREAM_PATH, e)))?;

    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        metrics::counter!("pushmail_connect_attempts_total").increment(1);

        let dial = connect_async(url.as_str());
        last_error = match tokio::time::timeout(policy.attempt_timeout, dial).await {
            Ok(Ok((socket, _response))) => {
                info!(endpoint = %endpoint, attempt, "Subscribed to event stream");
                metrics::gauge!("pushmail_stream_up").set(1.0);
                return Ok(EventStream {
                    inner: socket,
                    attempts: attempt,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "handshake timed out after {}ms",
                policy.attempt_timeout.as_millis()
            ),
        };

        metrics::gauge!("pushmail_stream_up").set(0.0);
        if attempt < max_attempts {
            log_connect_attempt(endpoint, attempt, policy.retry_delay, &last_error);
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    warn!(
        endpoint = %endpoint,
        attempts = max_attempts,
        error = %last_error,
        "Event stream unreachable, giving up"
    );
    Err(ConnectError::Unreachable {
        attempts: max_attempts,
        last: last_error,
    })
}

/// Log a failed dial that will be retried.
fn log_connect_attempt(endpoint: &str, attempt: u32, delay: Duration, error: &str) {
    warn!(
        endpoint = %endpoint,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Connection failed, retrying"
    );
}

/// A live subscription. Owned by exactly one bridge session.
pub struct EventStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    attempts: u32,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Number of dials it took to open this subscription.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Waits for the next notification.
    ///
    /// Control frames are skipped. Cancel-safe: dropping the future loses no
    /// decoded event.
    pub async fn read_event(&mut self) -> Result<Frame, ReadError> {
        loop {
            match self.inner.next().await {
                None => return Ok(Frame::Closed),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Hub closed the event stream");
                    return Ok(Frame::Closed);
                }
                Some(Ok(Message::Text(text))) => return decode_event(&text).map(Frame::Event),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "Skipping binary frame");
                    continue;
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(Frame::Closed);
                }
                Some(Err(e)) => return Err(classify_read_error(e)),
            }
        }
    }

    /// Performs the closing handshake within a two-second bound.
    ///
    /// A peer that stops reading or never acknowledges does not block the
    /// caller past the bound; the socket is dropped with the stream.
    pub async fn close(&mut self) -> Result<(), ReadError> {
        metrics::gauge!("pushmail_stream_up").set(0.0);
        let inner = &mut self.inner;
        let handshake = async {
            inner.close(None).await.map_err(classify_read_error)?;
            // Drain until the peer acknowledges the close.
            while let Some(Ok(_)) = inner.next().await {}
            Ok::<(), ReadError>(())
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, handshake).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Hub did not complete the close handshake in time");
                Ok(())
            }
        }
    }
}

/// Decodes a text frame into a notification.
pub fn decode_event(text: &str) -> Result<NotificationEvent, ReadError> {
    serde_json::from_str(text).map_err(|e| ReadError::Decode(e.to_string()))
}

fn classify_read_error(error: WsError) -> ReadError {
    match error {
        WsError::Io(e) => ReadError::ConnectionLost(e.to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ReadError::ConnectionLost("connection already closed".to_string())
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            ReadError::ConnectionLost(ProtocolError::ResetWithoutClosingHandshake.to_string())
        }
        other => ReadError::Transport(other.to_string()),
    }
}
