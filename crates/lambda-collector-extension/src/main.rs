//! AWS Lambda collector extension binary.
//!
//! Registers with the Extensions API, runs the OpenTelemetry collector as a
//! subprocess and stops it gracefully when the environment shuts down.
//!
//! # Configuration
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `/opt/otel-extension.toml` (or `LAMBDA_OTEL_CONFIG_FILE`)
//! 3. `AWS_LAMBDA_RUNTIME_API`, `OPENTELEMETRY_COLLECTOR_CONFIG_URI`,
//!    `OPENTELEMETRY_EXTENSION_LOG_LEVEL`
//! 4. Environment variables with `LAMBDA_OTEL_` prefix
//!
//! Pass `-v` to print the version and exit.

use anyhow::{Context, Result};
use clap::Parser;
use lambda_collector_extension::{
    CollectorEnv, Config, ExtensionError, ExtensionsClient, GIT_HASH, LifecycleManager,
    ManagerConfig, ProcessSupervisor, VERSION,
};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::{LevelFilter, ParseLevelFilterError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Lambda extension supervising an OpenTelemetry collector
#[derive(Parser, Debug)]
#[command(name = "lambda-collector-extension", about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
    /// Print version information and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.version {
        println!("{}", VERSION);
        return Ok(());
    }

    let config = Config::load()
        .map_err(ExtensionError::from)
        .context("failed to load configuration")?;

    let level_error = init_tracing(config.log_level.as_deref())
        .context("failed to initialise tracing subscriber")?;
    if let Some(e) = level_error {
        tracing::warn!(
            level = config.log_level.as_deref().unwrap_or_default(),
            error = %e,
            "Unable to parse log level, using default filter"
        );
    }

    tracing::info!(
        version = VERSION,
        git_hash = GIT_HASH.unwrap_or("unknown"),
        "Launching OpenTelemetry Lambda extension"
    );
    tracing::debug!(?config, "Configuration loaded");

    let collector_env = CollectorEnv::from_process(&config.collector.env);
    for deprecation in &collector_env.deprecations {
        tracing::warn!(
            deprecated = deprecation.deprecated,
            replacement = deprecation.replacement,
            note = deprecation.note,
            "Deprecated environment variable in use, its value was copied to the replacement"
        );
    }

    let runtime_api = config
        .extension
        .runtime_api
        .as_deref()
        .context("AWS_LAMBDA_RUNTIME_API is not set")?;
    let client = ExtensionsClient::new(runtime_api)
        .context("failed to create extensions API client")?
        .with_request_timeout(config.extension.request_timeout);

    let manager = LifecycleManager::new(
        ManagerConfig::from_config(&config, VERSION),
        client,
        ProcessSupervisor::new(),
        config.collector.command(&collector_env),
    );
    spawn_signal_handler(manager.cancellation_token());

    // Blocks until SHUTDOWN, cancellation or a fatal error.
    manager.run().await.context("extension lifecycle failed")?;

    Ok(())
}

/// Installs the subscriber. Returns the parse error for an unusable level
/// override so it can be logged once logging works.
fn init_tracing(level: Option<&str>) -> Result<Option<ParseLevelFilterError>> {
    let default_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (filter, level_error) = match level.map(parse_level) {
        Some(Ok(level)) => (EnvFilter::new(level.to_string()), None),
        Some(Err(e)) => (default_filter(), Some(e)),
        None => (default_filter(), None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()
        .context("failed to initialise tracing registry")?;

    Ok(level_error)
}

/// Parses a log level override. Accepts the `tracing` level names plus the
/// zap levels above `error`, which collapse to `error`.
fn parse_level(level: &str) -> std::result::Result<LevelFilter, ParseLevelFilterError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "dpanic" | "panic" | "fatal" => Ok(LevelFilter::ERROR),
        other => other.parse(),
    }
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(signal) => {
                tracing::info!(signal, "Received termination signal");
                token.cancel();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install signal handlers");
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
