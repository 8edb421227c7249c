//! Configuration loading and validation for pushmail.
//!
//! This module handles loading the YAML configuration file, in-place
//! normalization and validation, and environment variables for secrets.

mod env;
mod secret;
mod types;
mod validation;

pub use env::resolve_env_vars;
pub use secret::SecretString;
pub use types::{
    Config, DEFAULT_CONFIG_PATH, DiagnosticsConfig, ENV_MODE_VAR, FromIdentity, MailSettings,
    MetricsConfig, OperatingMode, TimingsConfig,
};
pub use validation::normalize_endpoint;
