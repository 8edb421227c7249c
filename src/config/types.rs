//! Core configuration types and loading.

use super::env::resolve_env_vars;
use super::secret::SecretString;
use super::validation::{non_blank, normalize_endpoint, parse_mailbox, validate_endpoint};
use crate::error::{ConfigError, MailSettingsError};
use crate::stream::{
    ConnectPolicy, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY,
};
use crate::supervisor::{BridgeTimings, DEFAULT_HEARTBEAT_INTERVAL};
use lettre::message::Mailbox;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pushmail/config.yaml";

/// Environment variable consulted by [`Config::default_from_env`].
pub const ENV_MODE_VAR: &str = "ENV";

/// Bridge configuration.
///
/// Must pass [`Config::validate`] before the supervisor uses it; validation
/// rewrites the value in place and the validated value is canonical.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Hub endpoint, normalized to `ws://` or `wss://` by validation.
    pub endpoint: String,
    /// Client token used to subscribe to the event stream.
    #[serde(default)]
    pub token: SecretString,
    /// Outbound mail settings.
    pub smtp: MailSettings,
    /// `production` or `diagnostic` (`development` accepted).
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Retry and heartbeat tuning.
    #[serde(default)]
    pub timings: TimingsConfig,
    /// Hub application used to echo diagnostics (standalone binary only).
    #[serde(default)]
    pub diagnostics: Option<DiagnosticsConfig>,
    /// Metrics exposition configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Operating mode of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// Quiet operation: errors only reach the process logs.
    Production,
    /// Verbose self-reporting through the host messenger, plus heartbeats.
    Diagnostic,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Production => "production",
            OperatingMode::Diagnostic => "diagnostic",
        }
    }
}

impl FromStr for OperatingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(OperatingMode::Production),
            "diagnostic" | "development" => Ok(OperatingMode::Diagnostic),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_mode() -> String {
    OperatingMode::Production.as_str().to_string()
}

/// SMTP submission settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MailSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Authentication identity; also the sender when `from.email` is unset.
    #[serde(default)]
    pub username: String,
    /// When present, submission is authenticated.
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub from: FromIdentity,
    #[serde(default)]
    pub to: Vec<String>,
    /// Optional subject prefix, rendered as `"<prefix>: <title>"`.
    #[serde(default)]
    pub subject: Option<String>,
    /// Selects the challenge-response auth mechanism. Adds no encryption.
    #[serde(default)]
    pub insecure: bool,
    /// HTML-escape title and body before embedding them in the message.
    #[serde(default)]
    pub escape_html: bool,
}

/// Optional sender overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FromIdentity {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl MailSettings {
    /// Normalizes the settings in place and checks their invariants.
    pub fn validate(&mut self) -> Result<(), MailSettingsError> {
        self.host = self.host.trim().to_string();
        self.username = self.username.trim().to_string();
        self.password = self.password.take().filter(|p| !p.is_empty());
        self.subject = non_blank(self.subject.take());
        self.from.email = non_blank(self.from.email.take());
        self.from.name = non_blank(self.from.name.take());
        self.to = self
            .to
            .iter()
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect();

        if self.host.is_empty() {
            return Err(MailSettingsError::MissingHost);
        }
        if self.port == 0 {
            return Err(MailSettingsError::InvalidPort);
        }
        self.sender()?;
        self.recipients()?;
        Ok(())
    }

    /// Sender address: `from.email` override, then `username`.
    pub fn sender_address(&self) -> Option<&str> {
        self.from
            .email
            .as_deref()
            .filter(|e| !e.is_empty())
            .or_else(|| Some(self.username.as_str()).filter(|u| !u.is_empty()))
    }

    /// Sender mailbox with the optional display name.
    pub fn sender(&self) -> Result<Mailbox, MailSettingsError> {
        let address = self.sender_address().ok_or(MailSettingsError::MissingSender)?;
        let mailbox = parse_mailbox("smtp.from", address)?;
        Ok(Mailbox::new(self.from.name.clone(), mailbox.email))
    }

    /// Recipient mailboxes in configured order.
    pub fn recipients(&self) -> Result<Vec<Mailbox>, MailSettingsError> {
        if self.to.is_empty() {
            return Err(MailSettingsError::NoRecipients);
        }
        self.to
            .iter()
            .map(|addr| parse_mailbox("smtp.to", addr))
            .collect()
    }

    /// Identity presented to the server when authenticating.
    pub fn auth_identity(&self) -> &str {
        if self.username.is_empty() {
            self.sender_address().unwrap_or_default()
        } else {
            &self.username
        }
    }
}

/// Connection retry and heartbeat tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimingsConfig {
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_attempt_timeout() -> Duration {
    DEFAULT_ATTEMPT_TIMEOUT
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl TimingsConfig {
    pub fn bridge_timings(&self) -> BridgeTimings {
        BridgeTimings {
            connect: ConnectPolicy {
                max_attempts: self.max_attempts,
                retry_delay: self.retry_delay,
                attempt_timeout: self.attempt_timeout,
            },
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// Hub application credentials for echoing diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiagnosticsConfig {
    pub app_token: SecretString,
    #[serde(default)]
    pub priority: Option<i64>,
}

/// Metrics exposition configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns [`ConfigError::LoadError`] if the file cannot be read.
    /// Returns [`ConfigError::ValidationError`] if the YAML is invalid or
    /// references an undefined environment variable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text and resolve `${VAR}` secrets.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        config.resolve_secrets()?;
        Ok(config)
    }

    fn resolve_secrets(&mut self) -> Result<(), ConfigError> {
        self.token = SecretString::new(resolve_env_vars(self.token.expose())?);
        self.smtp.username = resolve_env_vars(&self.smtp.username)?;
        if let Some(password) = &self.smtp.password {
            self.smtp.password = Some(SecretString::new(resolve_env_vars(password.expose())?));
        }
        if let Some(diagnostics) = &mut self.diagnostics {
            diagnostics.app_token =
                SecretString::new(resolve_env_vars(diagnostics.app_token.expose())?);
        }
        Ok(())
    }

    /// Normalize and validate in place. Idempotent.
    ///
    /// # Errors
    /// `InvalidEndpoint`, `MissingToken`, `InvalidMode` or `InvalidMail`,
    /// checked in that order.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.endpoint = normalize_endpoint(&self.endpoint);
        self.token = self.token.trimmed();
        self.mode = self.mode.trim().to_string();

        validate_endpoint(&self.endpoint)?;
        if self.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        self.mode.parse::<OperatingMode>()?;
        self.smtp.validate()?;

        if self.timings.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "timings.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.timings.attempt_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "timings.attempt_timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(diagnostics) = &mut self.diagnostics {
            diagnostics.app_token = diagnostics.app_token.trimmed();
        }
        Ok(())
    }

    /// Parsed operating mode; unrecognized values count as production.
    pub fn operating_mode(&self) -> OperatingMode {
        self.mode.trim().parse().unwrap_or(OperatingMode::Production)
    }

    /// Placeholder configuration for the given mode.
    ///
    /// The token is left empty, so the result does not validate until the
    /// host fills it in.
    pub fn default_for(mode: OperatingMode) -> Self {
        let smtp = match mode {
            OperatingMode::Diagnostic => MailSettings {
                host: "mailhog".to_string(),
                port: 1025,
                username: "username@example.com".to_string(),
                password: None,
                from: FromIdentity {
                    email: Some("from@example.com".to_string()),
                    name: Some("Pushmail".to_string()),
                },
                to: vec!["to@example.com".to_string()],
                subject: None,
                insecure: true,
                escape_html: false,
            },
            OperatingMode::Production => MailSettings {
                host: "smtp.example.com".to_string(),
                port: 587,
                username: "username@example.com".to_string(),
                password: None,
                from: FromIdentity::default(),
                to: vec!["to@example.com".to_string()],
                subject: None,
                insecure: false,
                escape_html: false,
            },
        };

        Self {
            endpoint: "ws://localhost".to_string(),
            token: SecretString::default(),
            smtp,
            mode: mode.as_str().to_string(),
            timings: TimingsConfig::default(),
            diagnostics: None,
            metrics: MetricsConfig::default(),
        }
    }

    /// Placeholder configuration, diagnostic when `ENV` says so.
    pub fn default_from_env() -> Self {
        let mode = match std::env::var(ENV_MODE_VAR).as_deref() {
            Ok("development") | Ok("diagnostic") => OperatingMode::Diagnostic,
            _ => OperatingMode::Production,
        };
        Self::default_for(mode)
    }
}
