//! Centralized error types for pushmail using thiserror.
//!
//! Fatal-to-enable errors (`ConfigError`, `ConnectError`) abort a start.
//! `ReadError` and `MailError` are recovered inside the read loop.

use thiserror::Error;

use crate::supervisor::BridgeState;

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    LoadError(String),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
    #[error("invalid endpoint '{0}': must be a ws:// or wss:// URL")]
    InvalidEndpoint(String),
    #[error("the token is not valid")]
    MissingToken,
    #[error("invalid mode '{0}': expected 'production' or 'diagnostic'")]
    InvalidMode(String),
    #[error("smtp is invalid: {0}")]
    InvalidMail(#[from] MailSettingsError),
}

/// Errors found while validating the SMTP section of the configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MailSettingsError {
    #[error("the smtp host is not valid")]
    MissingHost,
    #[error("the smtp port is not valid")]
    InvalidPort,
    #[error("no sender address: set smtp.username or smtp.from.email")]
    MissingSender,
    #[error("the smtp recipient list is empty")]
    NoRecipients,
    #[error("invalid {field} address: {message}")]
    InvalidAddress { field: String, message: String },
}

/// Errors establishing the event-stream subscription.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("invalid subscription url: {0}")]
    InvalidUrl(String),
    #[error("stream unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },
}

/// Errors while reading frames from a live subscription.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("could not decode event: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl ReadError {
    /// Whether the connection can still deliver frames after this error.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ReadError::ConnectionLost(_))
    }
}

/// Errors related to sending one email.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("failed to build email: {0}")]
    Build(String),
    #[error("could not send email: {0}")]
    TransportFailure(String),
}

/// Errors returned by the bridge supervisor to its host.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no configuration attached")]
    NoConfig,
    #[error("config is invalid: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("bridge is already {0}")]
    AlreadyInState(BridgeState),
    #[error("mail sender setup failed: {0}")]
    Mailer(#[from] MailError),
    #[error("could not close connection: {0}")]
    Close(String),
    #[error("bridge task failed: {0}")]
    TaskFailed(String),
}

/// Errors posting diagnostic messages back to the hub.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("failed to post hub message: {0}")]
    SendFailed(String),
    #[error("hub messenger queue full")]
    QueueFull,
}
