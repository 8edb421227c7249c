//! Hub messenger used by the standalone binary.
//!
//! Diagnostics are queued without blocking the caller and posted to the hub
//! as an application message by a background worker.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SecretString};
use crate::diagnostics::{HostMessenger, HubMessage};
use crate::error::HubError;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Priority used when the configuration sets none.
pub const DEFAULT_PRIORITY: i64 = 5;

/// Header carrying the application token.
pub const APP_TOKEN_HEADER: &str = "X-Gotify-Key";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Maps a normalized `ws://`/`wss://` endpoint to its HTTP base URL.
pub fn hub_http_base(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        endpoint.to_string()
    }
}

/// Where and as whom diagnostics are posted.
#[derive(Debug, Clone)]
pub struct HubTarget {
    pub base_url: String,
    pub app_token: SecretString,
    pub priority: i64,
}

impl HubTarget {
    /// Target from a validated config, if a diagnostics app token is set.
    pub fn from_config(config: &Config) -> Option<Self> {
        let diagnostics = config.diagnostics.as_ref()?;
        if diagnostics.app_token.is_empty() {
            return None;
        }
        Some(Self {
            base_url: hub_http_base(&config.endpoint),
            app_token: diagnostics.app_token.clone(),
            priority: diagnostics.priority.unwrap_or(DEFAULT_PRIORITY),
        })
    }

    fn message_url(&self) -> String {
        format!("{}/message", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct MessageBody<'a> {
    title: &'a str,
    message: &'a str,
    priority: i64,
}

/// Creates a messenger and the worker that drains it.
pub fn hub_channel(
    target: HubTarget,
    capacity: usize,
) -> Result<(HubMessenger, HubMessengerWorker), HubError> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| HubError::SendFailed(e.to_string()))?;
    let (tx, rx) = mpsc::channel(capacity.max(1));

    Ok((
        HubMessenger { tx },
        HubMessengerWorker { rx, client, target },
    ))
}

/// Non-blocking sending half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HubMessenger {
    tx: mpsc::Sender<HubMessage>,
}

impl HubMessenger {
    /// Queues a message without waiting.
    ///
    /// # Errors
    ///
    /// `HubError::QueueFull` when the worker is behind, `SendFailed` when it
    /// has stopped.
    pub fn enqueue(&self, message: HubMessage) -> Result<(), HubError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                HubError::SendFailed("hub messenger worker stopped".to_string())
            }
        })
    }

    pub fn into_host_messenger(self) -> Arc<dyn HostMessenger> {
        Arc::new(self)
    }
}

impl HostMessenger for HubMessenger {
    fn send_message(&self, message: HubMessage) {
        let title = message.title.clone();
        match self.enqueue(message) {
            Ok(()) => {}
            Err(HubError::QueueFull) => {
                tracing::warn!(title = %title, "Hub messenger queue full, dropping message");
                metrics::counter!("pushmail_hub_messages_dropped_total").increment(1);
            }
            Err(e) => {
                tracing::debug!(title = %title, error = %e, "Hub message not queued");
            }
        }
    }
}

/// Worker that posts queued messages to the hub.
pub struct HubMessengerWorker {
    rx: mpsc::Receiver<HubMessage>,
    client: reqwest::Client,
    target: HubTarget,
}

impl HubMessengerWorker {
    /// Run until cancelled or every messenger handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!(url = %self.target.message_url(), "Hub messenger started");

        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    match received {
                        Some(message) => {
                            if let Err(e) = self.post(&message).await {
                                tracing::warn!(title = %message.title, error = %e, "Failed to post hub message");
                            }
                        }
                        None => {
                            tracing::debug!("Hub messenger queue closed");
                            return;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("Hub messenger shutting down");
                    return;
                }
            }
        }
    }

    /// Posts one message to `<base>/message`.
    pub async fn post(&self, message: &HubMessage) -> Result<(), HubError> {
        let body = MessageBody {
            title: &message.title,
            message: &message.message,
            priority: self.target.priority,
        };

        self.client
            .post(self.target.message_url())
            .header(APP_TOKEN_HEADER, self.target.app_token.expose())
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map(|_| ())
            .map_err(|e| HubError::SendFailed(e.to_string()))
    }
}
