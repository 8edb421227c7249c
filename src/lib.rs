//! Pushmail - forward push-notification hub messages to email.

pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod hub;
pub mod mail;
pub mod metrics;
pub mod stream;
pub mod supervisor;

// Re-export commonly used types
pub use cli::LogFormat;
pub use diagnostics::{Diagnostics, HostMessenger, HubMessage};
pub use hub::{DEFAULT_QUEUE_CAPACITY, HubMessenger, HubMessengerWorker, HubTarget, hub_channel};
pub use mail::{AuthSelection, EmailTransport, Mailer, SmtpTransport};
pub use metrics::{MetricsServer, register_metric_descriptions};
pub use stream::{ConnectPolicy, EventStream, Frame, NotificationEvent};
pub use supervisor::{BridgeState, BridgeTimings, Supervisor};
