//! Portrelay - TCP/UDP port forwarder
//!
//! This is the main entry point for the Portrelay application.

use anyhow::{Context, Result};
use clap::Parser;
use portrelay::config::{load_config, save_config, Config};
use portrelay::host::HostProcess;
use portrelay::ProxyOrchestrator;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Portrelay - forward local TCP/UDP ports to configurable targets
#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

/// What ended a wait for signals
enum Signal {
    Shutdown,
    Reload,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    let config = read_config(&args.config)?;

    info!("Portrelay v{}", portrelay::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    let host = HostProcess::launch(&config.host);

    let mut orchestrator = ProxyOrchestrator::new(&config.host);
    orchestrator.apply(&config, false).await;
    log_statuses(&orchestrator);

    loop {
        match wait_for_signal().await {
            Signal::Shutdown => break,
            Signal::Reload => match read_config(&args.config) {
                Ok(config) => {
                    info!("Reloading configuration");
                    orchestrator.apply(&config, true).await;
                    log_statuses(&orchestrator);
                }
                Err(e) => warn!("Keeping current configuration: {:#}", e),
            },
        }
    }

    orchestrator.close_all().await;
    if let Some(host) = host {
        host.stop().await;
    }

    info!("Portrelay stopped");
    Ok(())
}

/// Load and validate the configuration, persisting any newly assigned ids
fn read_config(path: &Path) -> Result<Config> {
    let mut config = load_config(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", path))?;

    if config.ensure_ids() {
        save_config(path, &config)?;
    }
    Ok(config)
}

fn log_statuses(orchestrator: &ProxyOrchestrator) {
    for rule in orchestrator.rules() {
        info!(
            rule = %rule.config().id,
            active = rule.status(),
            "{}",
            rule.config()
        );
    }
}

/// Wait for Ctrl+C, SIGTERM or SIGHUP
async fn wait_for_signal() -> Signal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigterm), Ok(mut sighup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            warn!("Failed to setup signal handlers, only Ctrl+C is handled");
            let _ = tokio::signal::ctrl_c().await;
            return Signal::Shutdown;
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                Signal::Shutdown
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                Signal::Shutdown
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP");
                Signal::Reload
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
        Signal::Shutdown
    }
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
