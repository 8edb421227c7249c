//! Diagnostic side-channel back to the host's admin messenger.
//!
//! Active only in diagnostic mode and only when a messenger was supplied.
//! Reports are fire-and-forget.

use std::sync::Arc;

use crate::config::OperatingMode;

/// Title prefix of every diagnostic the bridge reports about itself.
///
/// Stream events whose title starts with it are never forwarded, so echoed
/// diagnostics cannot loop back into email.
pub const DIAGNOSTIC_MARKER: &str = "Pushmail: ";

pub const ERROR_TITLE: &str = "Pushmail: Error";
pub const ENABLED_TITLE: &str = "Pushmail: Enabled";
pub const DISABLED_TITLE: &str = "Pushmail: Disabled";
pub const CONFIG_TITLE: &str = "Pushmail: Configuration";

/// Heartbeat title. Deliberately outside the marker: a heartbeat echoed
/// through the hub is bridged like any notification, exercising the full path.
pub const HEARTBEAT_TITLE: &str = "Pushmail Heartbeat";

/// Whether an inbound title belongs to the bridge's own diagnostics.
pub fn is_self_generated(title: &str) -> bool {
    title.starts_with(DIAGNOSTIC_MARKER)
}

/// A message delivered to the host's admin-facing messenger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubMessage {
    pub title: String,
    pub message: String,
}

/// Message-delivery capability supplied by the host.
pub trait HostMessenger: Send + Sync {
    /// Deliver one message. Must not block.
    fn send_message(&self, message: HubMessage);
}

/// Diagnostic reporter bound to one operating mode.
#[derive(Clone)]
pub struct Diagnostics {
    messenger: Option<Arc<dyn HostMessenger>>,
    active: bool,
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("active", &self.active)
            .field("has_messenger", &self.messenger.is_some())
            .finish()
    }
}

impl Diagnostics {
    pub fn new(mode: OperatingMode, messenger: Option<Arc<dyn HostMessenger>>) -> Self {
        let active = mode == OperatingMode::Diagnostic && messenger.is_some();
        Self { messenger, active }
    }

    /// A reporter that drops everything.
    pub fn disabled() -> Self {
        Self {
            messenger: None,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Reports a status message. No-op when inactive.
    pub fn report(&self, title: &str, message: impl Into<String>) {
        if !self.active {
            return;
        }
        if let Some(messenger) = &self.messenger {
            messenger.send_message(HubMessage {
                title: title.to_string(),
                message: message.into(),
            });
        }
    }

    /// Reports an error under [`ERROR_TITLE`].
    pub fn error(&self, error: &dyn std::fmt::Display) {
        self.report(ERROR_TITLE, error.to_string());
    }
}
