//! Bridge supervisor: lifecycle state machine and the read-dispatch session.
//!
//! The supervisor owns at most one session. A session is a background task
//! that dials the hub, then reads events one at a time and hands each to the
//! [`Mailer`]. Events are processed strictly in arrival order; a slow mail
//! relay paces consumption.
//!
//! Stopping is cooperative: the session's `CancellationToken` is raced
//! against the pending read, and the task that owns the connection closes it
//! once the read loop has observed the cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::{Config, OperatingMode, SecretString};
use crate::diagnostics::{
    CONFIG_TITLE, DISABLED_TITLE, Diagnostics, ENABLED_TITLE, HEARTBEAT_TITLE, HostMessenger,
    is_self_generated,
};
use crate::error::{ReadError, SupervisorError};
use crate::mail::{EmailTransport, Mailer};
use crate::stream::{self, ConnectPolicy, EventStream, Frame};

/// Interval between diagnostic heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BridgeState::Disabled => "disabled",
            BridgeState::Enabling => "enabling",
            BridgeState::Enabled => "enabled",
            BridgeState::Disabling => "disabling",
        };
        f.write_str(name)
    }
}

/// Connection retry and heartbeat timings for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimings {
    pub connect: ConnectPolicy,
    pub heartbeat_interval: Duration,
}

impl Default for BridgeTimings {
    fn default() -> Self {
        Self {
            connect: ConnectPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// How a session task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionOutcome {
    /// Stopped by the host and the connection closed cleanly.
    Closed,
    /// Stopped by the host, but the closing handshake failed.
    CloseFailed(String),
    /// Stopped by the host before the dial succeeded.
    Abandoned,
    /// Ended on its own (dial budget exhausted, hub closed, connection lost).
    Ended(String),
}

/// Live session bookkeeping, owned by the supervisor.
struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<SessionOutcome>,
    /// Last fatal error published by the session task.
    fault: watch::Receiver<Option<String>>,
    diagnostics: Diagnostics,
}

/// Everything the session task owns.
struct SessionContext {
    endpoint: String,
    token: SecretString,
    mailer: Mailer,
    diagnostics: Diagnostics,
    timings: BridgeTimings,
    heartbeat_message: String,
    cancel: CancellationToken,
    fault: watch::Sender<Option<String>>,
}

/// Owns the bridge configuration, the session and the lifecycle state.
///
/// All entry points take `&mut self`; the session task communicates back
/// only through its join handle, its fault channel and its token.
pub struct Supervisor {
    config: Option<Config>,
    messenger: Option<Arc<dyn HostMessenger>>,
    transport: Option<Arc<dyn EmailTransport>>,
    timings: Option<BridgeTimings>,
    state: BridgeState,
    session: Option<Session>,
    last_error: Option<String>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("has_session", &self.session.is_some())
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            config: None,
            messenger: None,
            transport: None,
            timings: None,
            state: BridgeState::Disabled,
            session: None,
            last_error: None,
        }
    }

    /// Attaches a configuration as-is; it is validated on start.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Supplies the host's message-delivery capability.
    pub fn with_messenger(mut self, messenger: Arc<dyn HostMessenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// Replaces the SMTP transport, mainly for tests.
    pub fn with_transport(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the timings from the configuration.
    pub fn with_timings(mut self, timings: BridgeTimings) -> Self {
        self.timings = Some(timings);
        self
    }

    /// Supplies the messenger after construction. Takes effect on next start.
    pub fn set_messenger(&mut self, messenger: Option<Arc<dyn HostMessenger>>) {
        self.messenger = messenger;
    }

    /// Validates `config` and, on success, makes it the active configuration.
    ///
    /// A running session keeps the configuration it was started with.
    pub fn set_config(&mut self, mut config: Config) -> Result<(), SupervisorError> {
        let diagnostics = Diagnostics::new(config.operating_mode(), self.messenger.clone());
        if let Err(e) = config.validate() {
            warn!(error = %e, "Rejected configuration");
            diagnostics.error(&e);
            return Err(e.into());
        }

        if config.operating_mode() == OperatingMode::Diagnostic {
            info!(config = ?config, "Configuration updated");
            diagnostics.report(CONFIG_TITLE, format!("{:?}", config));
        }
        self.config = Some(config);
        Ok(())
    }

    /// The active configuration, if any.
    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    /// Current lifecycle state.
    ///
    /// Reports `Disabled` once a session has ended on its own.
    pub fn state(&self) -> BridgeState {
        match &self.session {
            Some(session) if session.handle.is_finished() => BridgeState::Disabled,
            _ => self.state,
        }
    }

    /// Token of the running session; cancelled when the session ends for
    /// any reason.
    pub fn session_token(&self) -> Option<CancellationToken> {
        self.session.as_ref().map(|s| s.cancel.clone())
    }

    /// Enables the bridge without waiting for the connection.
    ///
    /// # Errors
    ///
    /// - `AlreadyInState(Enabled)` if a session is running.
    /// - `NoConfig` if no configuration is attached.
    /// - `InvalidConfig` if validation fails.
    /// - `Mailer` if the mail sender cannot be built.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        self.reap_finished_session().await;
        if self.session.is_some() {
            return Err(SupervisorError::AlreadyInState(BridgeState::Enabled));
        }

        let mut config = self.config.clone().ok_or(SupervisorError::NoConfig)?;
        self.transition(BridgeState::Enabling);

        let diagnostics = Diagnostics::new(config.operating_mode(), self.messenger.clone());
        if let Err(e) = config.validate() {
            return Err(self.abort_start(&diagnostics, e.into()));
        }
        // The normalized value becomes the canonical configuration.
        self.config = Some(config.clone());

        let mailer = match &self.transport {
            Some(transport) => Mailer::with_transport(&config.smtp, transport.clone()),
            None => Mailer::from_settings(&config.smtp),
        };
        let mailer = match mailer {
            Ok(mailer) => mailer,
            Err(e) => return Err(self.abort_start(&diagnostics, e.into())),
        };

        let timings = self
            .timings
            .unwrap_or_else(|| config.timings.bridge_timings());
        let cancel = CancellationToken::new();
        let (fault_tx, fault_rx) = watch::channel(None);

        let span = tracing::info_span!(
            "bridge_session",
            endpoint = %config.endpoint,
            mode = %config.operating_mode()
        );
        let context = SessionContext {
            heartbeat_message: format!(
                "forwarding {} to {} recipient(s)",
                config.endpoint,
                config.smtp.to.len()
            ),
            endpoint: config.endpoint,
            token: config.token,
            mailer,
            diagnostics: diagnostics.clone(),
            timings,
            cancel: cancel.clone(),
            fault: fault_tx,
        };
        let handle = tokio::spawn(run_session(context).instrument(span));

        self.last_error = None;
        self.session = Some(Session {
            cancel,
            handle,
            fault: fault_rx,
            diagnostics,
        });
        self.transition(BridgeState::Enabled);
        info!("Bridge enabled");
        Ok(())
    }

    /// Disables the bridge, closing the connection.
    ///
    /// The state is `Disabled` afterwards whatever the result.
    ///
    /// # Errors
    ///
    /// - `AlreadyInState(Disabled)` if no session exists.
    /// - `Close` if the connection could not be closed, including when the
    ///   session had already ended on its own.
    /// - `TaskFailed` if the session task panicked.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(session) = self.session.take() else {
            return Err(SupervisorError::AlreadyInState(BridgeState::Disabled));
        };

        self.transition(BridgeState::Disabling);
        session.cancel.cancel();
        let outcome = session.handle.await;
        self.transition(BridgeState::Disabled);

        // An internal stop already announced itself.
        let announced = matches!(outcome, Ok(SessionOutcome::Ended(_)));
        let result = match outcome {
            Ok(SessionOutcome::Closed) | Ok(SessionOutcome::Abandoned) => Ok(()),
            Ok(SessionOutcome::CloseFailed(reason)) => Err(SupervisorError::Close(reason)),
            Ok(SessionOutcome::Ended(reason)) => {
                self.last_error = Some(reason.clone());
                Err(SupervisorError::Close(format!(
                    "connection already closed: {}",
                    reason
                )))
            }
            Err(e) => Err(SupervisorError::TaskFailed(e.to_string())),
        };

        match &result {
            Ok(()) => info!("Bridge disabled"),
            Err(e) => {
                warn!(error = %e, "Bridge disabled with error");
                session.diagnostics.error(e);
            }
        }
        if !announced {
            session.diagnostics.report(DISABLED_TITLE, "bridge stopped");
        }
        result
    }

    /// Status text for the host UI.
    pub fn display(&self, is_admin: bool) -> String {
        if !is_admin {
            return "Only system administrators can view the bridge status.".to_string();
        }

        if let Some(error) = self.current_fault() {
            return format!("Last error: {}", error);
        }
        match self.state() {
            BridgeState::Enabled | BridgeState::Enabling => {
                "The bridge is running. Notifications from the hub are forwarded by email."
                    .to_string()
            }
            BridgeState::Disabled | BridgeState::Disabling => {
                "The bridge is disabled. Set the hub endpoint, client token and SMTP settings, then enable it."
                    .to_string()
            }
        }
    }

    fn current_fault(&self) -> Option<String> {
        self.session
            .as_ref()
            .and_then(|s| s.fault.borrow().clone())
            .or_else(|| self.last_error.clone())
    }

    fn transition(&mut self, to: BridgeState) {
        debug!(from = %self.state, to = %to, "Bridge state transition");
        self.state = to;
    }

    fn abort_start(&mut self, diagnostics: &Diagnostics, error: SupervisorError) -> SupervisorError {
        warn!(error = %error, "Bridge failed to start");
        diagnostics.error(&error);
        self.last_error = Some(error.to_string());
        self.transition(BridgeState::Disabled);
        error
    }

    /// Collects a session that ended on its own.
    async fn reap_finished_session(&mut self) {
        let finished = self
            .session
            .as_ref()
            .is_some_and(|s| s.handle.is_finished());
        if !finished {
            return;
        }
        if let Some(session) = self.session.take() {
            match session.handle.await {
                Ok(SessionOutcome::Ended(reason)) => self.last_error = Some(reason),
                Ok(_) => {}
                Err(e) => self.last_error = Some(e.to_string()),
            }
            self.transition(BridgeState::Disabled);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

/// Why the read loop returned.
enum LoopEnd {
    Cancelled,
    HubClosed,
    Lost(ReadError),
}

async fn run_session(context: SessionContext) -> SessionOutcome {
    let connected = tokio::select! {
        biased;
        _ = context.cancel.cancelled() => {
            info!("Stop requested while connecting");
            return SessionOutcome::Abandoned;
        }
        result = stream::connect(&context.endpoint, context.token.expose(), &context.timings.connect) => result,
    };

    let mut stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Could not subscribe to the event stream");
            return end_session(&context, e.to_string());
        }
    };
    context.diagnostics.report(
        ENABLED_TITLE,
        format!("subscribed after {} attempt(s)", stream.attempts()),
    );

    let heartbeat = context.diagnostics.is_active().then(|| {
        tokio::spawn(
            run_heartbeat(
                context.diagnostics.clone(),
                context.timings.heartbeat_interval,
                context.heartbeat_message.clone(),
                context.cancel.child_token(),
            )
            .in_current_span(),
        )
    });

    let outcome = match read_loop(&mut stream, &context).await {
        LoopEnd::Cancelled => match stream.close().await {
            Ok(()) => {
                debug!("Event stream closed");
                SessionOutcome::Closed
            }
            Err(e) => SessionOutcome::CloseFailed(e.to_string()),
        },
        LoopEnd::HubClosed => end_session(&context, "hub closed the event stream".to_string()),
        LoopEnd::Lost(e) => end_session(&context, e.to_string()),
    };

    context.cancel.cancel();
    if let Some(heartbeat) = heartbeat {
        let _ = heartbeat.await;
    }
    outcome
}

/// Records a fatal error and signals the internal stop.
fn end_session(context: &SessionContext, reason: String) -> SessionOutcome {
    warn!(reason = %reason, "Bridge session ended");
    metrics::gauge!("pushmail_stream_up").set(0.0);
    context.diagnostics.error(&reason);
    context
        .diagnostics
        .report(DISABLED_TITLE, format!("bridge stopped: {}", reason));
    context.fault.send_replace(Some(reason.clone()));
    context.cancel.cancel();
    SessionOutcome::Ended(reason)
}

async fn read_loop(stream: &mut EventStream, context: &SessionContext) -> LoopEnd {
    loop {
        let frame = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => return LoopEnd::Cancelled,
            frame = stream.read_event() => frame,
        };

        match frame {
            Ok(Frame::Event(event)) => {
                metrics::counter!("pushmail_events_received_total").increment(1);
                if is_self_generated(&event.title) {
                    debug!(title = %event.title, "Skipping self-generated diagnostic");
                    metrics::counter!("pushmail_events_filtered_total").increment(1);
                    continue;
                }

                debug!(id = event.id, title = %event.title, "Forwarding notification");
                if let Err(e) = context.mailer.send(&event.title, &event.message).await {
                    warn!(title = %event.title, error = %e, "Failed to forward notification");
                    context.diagnostics.error(&e);
                }
            }
            Ok(Frame::Closed) => return LoopEnd::HubClosed,
            Err(e) if e.is_transient() => {
                metrics::counter!("pushmail_read_errors_total").increment(1);
                warn!(error = %e, "Read error on event stream");
                context.diagnostics.error(&e);
            }
            Err(e) => {
                metrics::counter!("pushmail_read_errors_total").increment(1);
                return LoopEnd::Lost(e);
            }
        }
    }
}

async fn run_heartbeat(
    diagnostics: Diagnostics,
    period: Duration,
    message: String,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => diagnostics.report(HEARTBEAT_TITLE, message.clone()),
        }
    }
}
