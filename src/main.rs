//! Pushmail - forward push-notification hub messages to email.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pushmail::cli::{Cli, LogFormat};
use pushmail::config::Config;
use pushmail::{
    AuthSelection, DEFAULT_QUEUE_CAPACITY, HubTarget, MetricsServer, Supervisor, hub_channel,
};

/// Initialize the tracing subscriber with the specified log format.
fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    info!(config_path = %cli.config.display(), "Loading configuration");

    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!("Validating configuration");
    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    if cli.validate {
        println!("Configuration is valid: {}", cli.config.display());
        println!("  Endpoint: {}", config.endpoint);
        println!("  Mode: {}", config.operating_mode());
        println!(
            "  SMTP: {}:{} (auth: {:?})",
            config.smtp.host,
            config.smtp.port,
            AuthSelection::for_settings(&config.smtp)
        );
        println!("  Recipients: {}", config.smtp.to.len());
        println!(
            "  Diagnostics: {}",
            if HubTarget::from_config(&config).is_some() {
                "hub messenger"
            } else {
                "logs only"
            }
        );
        println!(
            "  Metrics: {} (port {})",
            if config.metrics.enabled {
                "enabled"
            } else {
                "disabled"
            },
            config.metrics.port
        );
        return Ok(());
    }

    info!(config_path = %cli.config.display(), "pushmail starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

/// Main async entry point.
async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    let metrics_handle = if config.metrics.enabled {
        let server = MetricsServer::new(config.metrics.port);
        let cancel_metrics = cancel.clone();
        info!(port = config.metrics.port, "Starting metrics server");
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(cancel_metrics).await {
                error!(error = %e, "Metrics server error");
            }
        }))
    } else {
        info!("Metrics server disabled");
        None
    };

    let mut supervisor = Supervisor::new();
    let hub_handle = match HubTarget::from_config(&config) {
        Some(target) => {
            let (messenger, worker) = hub_channel(target, DEFAULT_QUEUE_CAPACITY)?;
            supervisor.set_messenger(Some(messenger.into_host_messenger()));
            Some(tokio::spawn(worker.run(cancel.clone())))
        }
        None => None,
    };

    supervisor.set_config(config)?;
    supervisor.start().await?;

    let session = supervisor.session_token().unwrap_or_default();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received shutdown signal, stopping bridge"),
                Err(e) => error!(error = %e, "Failed to listen for ctrl-c signal"),
            }
        }
        _ = session.cancelled() => {
            warn!("Bridge stopped on its own");
        }
    }

    let stop_result = supervisor.stop().await;
    cancel.cancel();

    if let Some(handle) = hub_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    match stop_result {
        Ok(()) => {
            info!("pushmail shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Bridge stopped with error");
            Err(anyhow::anyhow!("bridge error: {}", e))
        }
    }
}
