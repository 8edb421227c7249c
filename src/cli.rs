//! Command-line interface for pushmail using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format for journalctl (default).
    #[default]
    Text,
    /// Structured JSON format for log aggregation.
    Json,
}

/// Forward push-notification hub messages to email.
#[derive(Parser, Debug)]
#[command(name = "pushmail")]
#[command(version)]
#[command(about = "Forward push-notification hub messages to email")]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Validate configuration and exit.
    #[arg(long = "validate")]
    pub validate: bool,

    /// Log format: text or json.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,
}
